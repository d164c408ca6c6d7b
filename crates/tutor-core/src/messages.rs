//! JSON-RPC message types exchanged over the session channel.
//!
//! A client call is a [`Request`] naming a remote method. The server answers
//! with one or more [`Response`]s carrying the same `marker`; intermediate
//! replies of a streaming call have `eod == 0`, the final one `eod == 1`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A remote call issued by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen call identifier echoed on every reply.
    pub marker: u64,
    pub function_name: String,
    #[serde(default)]
    pub parameters_list: Vec<Value>,
}

/// A reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub marker: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// End-of-data flag: `0` while a streaming call continues, `1` on the last reply.
    pub eod: u8,
}

impl Response {
    /// Final reply carrying a value.
    pub fn result(marker: u64, value: Value) -> Self {
        Self {
            marker,
            result: Some(value),
            error: None,
            eod: 1,
        }
    }

    /// Intermediate reply of a streaming call.
    pub fn partial(marker: u64, value: Value) -> Self {
        Self {
            marker,
            result: Some(value),
            error: None,
            eod: 0,
        }
    }

    /// Final reply carrying an error.
    pub fn error(marker: u64, code: u16, message: impl Into<String>) -> Self {
        Self {
            marker,
            result: None,
            error: Some(ErrorPayload {
                code,
                message: message.into(),
            }),
            eod: 1,
        }
    }

    pub fn is_final(&self) -> bool {
        self.eod != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// Remote methods exposed by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetCourse,
    Start,
    Next,
    Back,
    Seek,
    Position,
    ReadStudentTerminal,
    ReadTutorTerminal,
    Enter,
    ShowMeHow,
    Pause,
}

impl Method {
    /// Resolve a wire name, accepting the legacy `read_*_fd` spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "get_course" => Self::GetCourse,
            "start" => Self::Start,
            "next" => Self::Next,
            "back" => Self::Back,
            "seek" => Self::Seek,
            "position" => Self::Position,
            "read_student_terminal" | "read_student_fd" => Self::ReadStudentTerminal,
            "read_tutor_terminal" | "read_tutor_fd" => Self::ReadTutorTerminal,
            "enter" => Self::Enter,
            "show_me_how" => Self::ShowMeHow,
            "pause" => Self::Pause,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetCourse => "get_course",
            Self::Start => "start",
            Self::Next => "next",
            Self::Back => "back",
            Self::Seek => "seek",
            Self::Position => "position",
            Self::ReadStudentTerminal => "read_student_terminal",
            Self::ReadTutorTerminal => "read_tutor_terminal",
            Self::Enter => "enter",
            Self::ShowMeHow => "show_me_how",
            Self::Pause => "pause",
        }
    }
}

/// Small integer status codes returned by `start`, `get_course` and `show_me_how`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Status {
    Ready = 0,
    Failed = 1,
    CourseDoesNotExist = 2,
    EndOfScript = 3,
    ScriptPaused = 4,
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Failed),
            2 => Ok(Self::CourseDoesNotExist),
            3 => Ok(Self::EndOfScript),
            4 => Ok(Self::ScriptPaused),
            _ => Err(format!("unknown status code: {v}")),
        }
    }
}

/// Session participant; each role gets its own sandbox and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Tutor,
}

impl Role {
    /// Lowercase name, also used as the login inside the sandbox.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Tutor => "tutor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Curriculum position reported after navigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Cursor, `1..=outof`.
    pub n: usize,
    /// Number of navigable entries (the introduction is not counted).
    pub outof: usize,
    /// Index of the lesson the entry belongs to.
    pub lesson: usize,
    /// Opaque entry payload (lesson or lesson step).
    pub entry: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_as_integer() {
        assert_eq!(serde_json::to_value(Status::Ready).unwrap(), json!(0));
        assert_eq!(serde_json::to_value(Status::ScriptPaused).unwrap(), json!(4));
        let s: Status = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(s, Status::CourseDoesNotExist);
        assert!(serde_json::from_value::<Status>(json!(9)).is_err());
    }

    #[test]
    fn error_reply_omits_result() {
        let resp = Response::error(7, 10, "lesson out of range");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            v,
            json!({"marker": 7, "error": {"code": 10, "message": "lesson out of range"}, "eod": 1})
        );
    }

    #[test]
    fn partial_reply_keeps_stream_open() {
        let resp = Response::partial(3, json!("$ "));
        assert!(!resp.is_final());
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"marker": 3, "result": "$ ", "eod": 0})
        );
    }

    #[test]
    fn legacy_method_names() {
        assert_eq!(Method::from_name("read_student_fd"), Some(Method::ReadStudentTerminal));
        assert_eq!(Method::from_name("read_tutor_terminal"), Some(Method::ReadTutorTerminal));
        assert_eq!(Method::from_name("shutdown"), None);
        assert_eq!(Method::ShowMeHow.name(), "show_me_how");
    }

    #[test]
    fn request_without_parameters() {
        let req: Request =
            serde_json::from_value(json!({"marker": 1, "function_name": "start"})).unwrap();
        assert!(req.parameters_list.is_empty());
    }
}
