use thiserror::Error;

/// Errors produced by the tutoring session orchestrator.
#[derive(Debug, Error)]
pub enum TutorError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("lesson out of range")]
    OutOfRange,

    #[error("invalid lesson: {0}")]
    InvalidLesson(i64),

    #[error("session not started")]
    NotStarted,

    #[error("timeout waiting for port {port} after {attempts} attempts")]
    Timeout { port: u16, attempts: u32 },

    #[error("course does not exist: {0}")]
    CourseNotFound(String),

    #[error("course fetch failed: {0}")]
    CourseFetch(String),

    #[error("sandbox start failed: {0}")]
    SandboxStart(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("terminal open failed: {0}")]
    TerminalOpen(String),

    #[error("terminal write failed: {0}")]
    TerminalWrite(String),

    #[error("no {0} terminal is open")]
    TerminalNotOpen(String),

    #[error("autopilot is already playing")]
    AutopilotBusy,

    #[error("session closed")]
    SessionClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TutorError {
    fn from(e: serde_json::Error) -> Self {
        TutorError::Codec(e.to_string())
    }
}

impl TutorError {
    /// Stable numeric code carried in error replies.
    pub fn code(&self) -> u16 {
        match self {
            TutorError::Codec(_) => 1,
            TutorError::InvalidMessage(_) => 2,
            TutorError::UnknownMethod(_) => 3,
            TutorError::Transport(_) => 4,
            TutorError::OutOfRange => 10,
            TutorError::InvalidLesson(_) => 11,
            TutorError::NotStarted => 12,
            TutorError::Timeout { .. } => 20,
            TutorError::CourseNotFound(_) => 30,
            TutorError::CourseFetch(_) => 31,
            TutorError::SandboxStart(_) => 40,
            TutorError::Sandbox(_) => 41,
            TutorError::TerminalOpen(_) => 50,
            TutorError::TerminalWrite(_) => 51,
            TutorError::TerminalNotOpen(_) => 52,
            TutorError::AutopilotBusy => 53,
            TutorError::SessionClosed => 60,
            TutorError::Config(_) => 70,
            TutorError::Io(_) => 80,
            TutorError::Other(_) => 99,
        }
    }

    /// Whether this error tears the whole session down.
    ///
    /// Student input and sandbox start-up are the critical path; losing
    /// either leaves nothing useful for the client to interact with.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            TutorError::SandboxStart(_) | TutorError::TerminalWrite(_) | TutorError::SessionClosed
        )
    }
}

pub type TutorResult<T> = Result<T, TutorError>;
