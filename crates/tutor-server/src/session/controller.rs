//! Session controller: one per client connection.
//!
//! Owns the sandboxes, terminals, curriculum cursor and autopilot of a
//! session and sequences start-up, navigation and teardown across them.
//!
//! Locking: `state` is the navigation lock and is taken before `terminals`
//! or `autopilot` whenever both are needed. The autopilot lock is held for
//! the whole of a playback; pausing goes through the shared [`PauseHandle`]
//! and never waits on it.

use super::navigator::{Curriculum, Entry, Navigator};
use super::pty::{Terminal, TerminalCommand};
use super::sandbox::{Sandbox, SandboxEngine, SandboxSpec};
use super::tutorbot::{Pacing, PauseHandle, PlayOutcome, Tutorbot};
use crate::config::SessionSettings;
use crate::course::CourseSource;
use crate::net::{allocate_port, Readiness};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use tutor_core::{Position, Role, Status, TutorError, TutorResult};

struct SessionState {
    course: Option<Value>,
    curriculum: Curriculum,
    navigator: Navigator,
    sandboxes: HashMap<Role, Sandbox>,
    /// Lesson the tutor sandbox was last brought up for, set once it is
    /// reachable. `None` means the tutor needs a fresh launch.
    tutor_lesson: Option<usize>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            course: None,
            curriculum: Curriculum::default(),
            navigator: Navigator::new(0),
            sandboxes: HashMap::new(),
            tutor_lesson: None,
        }
    }

    fn load_course(&mut self, course: Value) {
        self.curriculum = Curriculum::from_course(&course);
        self.navigator = Navigator::new(self.curriculum.len());
        self.course = Some(course);
    }

    fn position(&self) -> Option<Position> {
        if !self.navigator.is_started() {
            return None;
        }
        self.curriculum.position(self.navigator.cursor())
    }

    fn current_entry(&self) -> Option<&Entry> {
        if !self.navigator.is_started() {
            return None;
        }
        self.curriculum.entry(self.navigator.cursor())
    }
}

pub struct SessionController {
    id: String,
    settings: SessionSettings,
    engine: Arc<dyn SandboxEngine>,
    courses: Arc<dyn CourseSource>,
    state: Mutex<SessionState>,
    terminals: Mutex<HashMap<Role, Terminal>>,
    autopilot: Mutex<Option<Tutorbot>>,
    pause: std::sync::Mutex<Option<PauseHandle>>,
    closed: AtomicBool,
}

impl SessionController {
    pub fn new(
        id: String,
        settings: SessionSettings,
        engine: Arc<dyn SandboxEngine>,
        courses: Arc<dyn CourseSource>,
    ) -> Self {
        Self {
            id,
            settings,
            engine,
            courses,
            state: Mutex::new(SessionState::new()),
            terminals: Mutex::new(HashMap::new()),
            autopilot: Mutex::new(None),
            pause: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fetch the course once; later calls return the cached copy.
    pub async fn get_course(&self, course_id: &str) -> TutorResult<Value> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if let Some(course) = &state.course {
            return Ok(course.clone());
        }

        let course = self.courses.fetch(course_id).await?;
        state.load_course(course.clone());
        info!(
            session_id = %self.id,
            course_id,
            entries = state.curriculum.len(),
            "course loaded"
        );
        Ok(course)
    }

    /// Start both sandboxes and place the cursor on the first lesson.
    ///
    /// A readiness timeout stops everything again and reports
    /// [`Status::Failed`] so the client can retry.
    pub async fn start(&self) -> TutorResult<Status> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.navigator.is_started() {
            return Ok(Status::Ready);
        }

        if state.course.is_none() {
            match self.courses.default_course() {
                Some(course) => state.load_course(course),
                None => return Ok(Status::CourseDoesNotExist),
            }
        }
        if state.curriculum.is_empty() {
            warn!(session_id = %self.id, "course has no lessons");
            return Ok(Status::Failed);
        }

        let lesson = state.curriculum.lesson_of(1).unwrap_or(1);
        let student_port = self.launch(&mut state, Role::Student, lesson).await?;
        let tutor_port = self.launch(&mut state, Role::Tutor, lesson).await?;

        let readiness = self.readiness();
        let (student, tutor) =
            tokio::join!(readiness.wait(student_port), readiness.wait(tutor_port));
        if let Err(e) = student.and(tutor) {
            warn!(session_id = %self.id, error = %e, "sandboxes not ready, start failed");
            Self::stop_sandboxes(&mut state).await;
            return Ok(Status::Failed);
        }

        state.navigator.start()?;
        state.tutor_lesson = Some(lesson);
        info!(
            session_id = %self.id,
            student_port,
            tutor_port,
            outof = state.navigator.bound(),
            "session ready"
        );
        Ok(Status::Ready)
    }

    pub async fn next(&self) -> TutorResult<Position> {
        self.navigate(Navigator::next).await
    }

    pub async fn back(&self) -> TutorResult<Position> {
        self.navigate(Navigator::back).await
    }

    pub async fn seek(&self, n: i64) -> TutorResult<Position> {
        self.navigate(|nav: &mut Navigator| nav.seek(n)).await
    }

    /// Current position, `None` before start.
    pub async fn position(&self) -> TutorResult<Option<Position>> {
        self.ensure_open()?;
        Ok(self.state.lock().await.position())
    }

    /// Open the role's terminal and stream its output into `sink`.
    ///
    /// An already open terminal for the role is closed first; its stream
    /// then ends.
    pub async fn open_terminal(&self, role: Role, sink: mpsc::Sender<String>) -> TutorResult<()> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let port = state
            .sandboxes
            .get(&role)
            .and_then(Sandbox::port)
            .ok_or(TutorError::NotStarted)?;
        let command = TerminalCommand::ssh(&self.settings.terminal, role, port);

        let mut terminals = self.terminals.lock().await;
        if let Some(previous) = terminals.remove(&role) {
            info!(session_id = %self.id, role = %role, "replacing open terminal");
            previous.close().await;
        }

        let mut terminal = Terminal::open(role, &command)?;
        terminal.register_reader(sink)?;
        terminals.insert(role, terminal);
        debug!(session_id = %self.id, role = %role, port, "terminal attached");
        Ok(())
    }

    /// Forward input to the student terminal.
    ///
    /// A failed write destroys the session; the returned error is fatal.
    pub async fn enter(&self, data: String) -> TutorResult<()> {
        self.ensure_open()?;
        let writer = {
            let terminals = self.terminals.lock().await;
            terminals
                .get(&Role::Student)
                .map(Terminal::writer)
                .ok_or_else(|| TutorError::TerminalNotOpen(Role::Student.to_string()))?
        };

        let Err(e) = writer.write_async(data.into_bytes()).await else {
            return Ok(());
        };
        let reason = e.to_string();
        error!(session_id = %self.id, error = %reason, "student terminal write failed");
        self.destroy().await;
        Err(TutorError::TerminalWrite(reason))
    }

    /// Type the current entry's script into the tutor terminal.
    pub async fn show_me_how(&self) -> TutorResult<Status> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        if !state.navigator.is_started() {
            return Err(TutorError::NotStarted);
        }

        let mut writer = {
            let terminals = self.terminals.lock().await;
            terminals
                .get(&Role::Tutor)
                .map(Terminal::writer)
                .ok_or_else(|| TutorError::TerminalNotOpen(Role::Tutor.to_string()))?
        };

        let Ok(mut autopilot) = self.autopilot.try_lock() else {
            return Err(TutorError::AutopilotBusy);
        };

        if autopilot.is_none() {
            let Some(script) = state.current_entry().and_then(Entry::script) else {
                debug!(session_id = %self.id, "entry has no script");
                return Ok(Status::EndOfScript);
            };
            let bot = Tutorbot::new(script, self.pacing());
            self.set_pause_handle(Some(bot.pause_handle()));
            *autopilot = Some(bot);
        }
        let Some(bot) = autopilot.as_mut() else {
            return Ok(Status::EndOfScript);
        };

        // Resume while navigation is still locked out, so a navigation that
        // pauses the bot after this point is observed by `run`.
        bot.resume();
        drop(state);

        let outcome = bot.run(&mut writer).await;
        debug!(session_id = %self.id, ?outcome, "autopilot stopped");
        Ok(match outcome {
            PlayOutcome::EndOfScript => Status::EndOfScript,
            PlayOutcome::Paused | PlayOutcome::Aborted => Status::ScriptPaused,
        })
    }

    /// Pause the autopilot if it is playing.
    pub fn pause(&self) -> TutorResult<()> {
        self.ensure_open()?;
        self.signal_pause();
        Ok(())
    }

    /// Install a terminal without spawning anything.
    #[cfg(test)]
    pub(crate) async fn attach_terminal(&self, terminal: Terminal) {
        self.terminals.lock().await.insert(terminal.role(), terminal);
    }

    /// Release everything the session holds. Idempotent and never fails.
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.id, "destroying session");

        let mut state = self.state.lock().await;
        self.discard_autopilot().await;

        let terminals: Vec<Terminal> = self
            .terminals
            .lock()
            .await
            .drain()
            .map(|(_, terminal)| terminal)
            .collect();
        for terminal in terminals {
            debug!(session_id = %self.id, role = %terminal.role(), "closing terminal");
            terminal.close().await;
        }

        Self::stop_sandboxes(&mut state).await;
        info!(session_id = %self.id, "session destroyed");
    }

    async fn navigate<F>(&self, step: F) -> TutorResult<Position>
    where
        F: FnOnce(&mut Navigator) -> TutorResult<usize>,
    {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let previous = state.navigator.cursor();
        let cursor = step(&mut state.navigator)?;

        if cursor != previous {
            // The script belongs to the entry being left.
            self.discard_autopilot().await;
        }

        let lesson = state.curriculum.lesson_of(cursor).unwrap_or(cursor);
        if state.tutor_lesson != Some(lesson) && self.settings.sandbox.restart_on_lesson_change {
            info!(
                session_id = %self.id,
                from = ?state.tutor_lesson,
                to = lesson,
                "lesson changed, restarting tutor sandbox"
            );
            if let Err(e) = self.restart_tutor(&mut state, lesson).await {
                if !e.is_session_fatal() {
                    state.navigator.revert(previous);
                }
                warn!(session_id = %self.id, error = %e, cursor = previous, "lesson change failed");
                return Err(e);
            }
        }

        state
            .curriculum
            .position(cursor)
            .ok_or(TutorError::OutOfRange)
    }

    async fn restart_tutor(&self, state: &mut SessionState, lesson: usize) -> TutorResult<()> {
        self.close_terminal(Role::Tutor).await;
        state.tutor_lesson = None;
        let port = self.launch(state, Role::Tutor, lesson).await?;
        self.readiness().wait(port).await?;
        state.tutor_lesson = Some(lesson);
        Ok(())
    }

    /// Replace the role's sandbox with a fresh one on a new port.
    async fn launch(&self, state: &mut SessionState, role: Role, lesson: usize) -> TutorResult<u16> {
        if let Some(mut previous) = state.sandboxes.remove(&role) {
            previous.stop().await;
        }

        let port = allocate_port()?;
        let spec = SandboxSpec::for_role(
            &self.settings.sandbox,
            self.settings.image_for(role),
            role,
            port,
            lesson,
        );
        let sandbox = Sandbox::launch(
            self.engine.as_ref(),
            &self.settings.sandbox.name_prefix,
            spec,
        )
        .await?;
        info!(
            session_id = %self.id,
            role = %role,
            sandbox = %sandbox.name(),
            port,
            lesson,
            "sandbox launched"
        );
        state.sandboxes.insert(role, sandbox);
        Ok(port)
    }

    async fn close_terminal(&self, role: Role) {
        let terminal = self.terminals.lock().await.remove(&role);
        if let Some(terminal) = terminal {
            terminal.close().await;
        }
    }

    async fn stop_sandboxes(state: &mut SessionState) {
        state.tutor_lesson = None;
        let sandboxes: Vec<Sandbox> = state.sandboxes.drain().map(|(_, s)| s).collect();
        for mut sandbox in sandboxes {
            sandbox.stop().await;
        }
    }

    /// Pause, wait for the playback to let go, then drop the bot.
    async fn discard_autopilot(&self) {
        self.signal_pause();
        let mut autopilot = self.autopilot.lock().await;
        if autopilot.take().is_some() {
            debug!(session_id = %self.id, "autopilot discarded");
        }
        self.set_pause_handle(None);
    }

    fn signal_pause(&self) {
        let handle = self.pause.lock().ok().and_then(|guard| (*guard).clone());
        if let Some(handle) = handle {
            handle.pause();
            debug!(session_id = %self.id, "autopilot pause requested");
        }
    }

    fn set_pause_handle(&self, handle: Option<PauseHandle>) {
        if let Ok(mut guard) = self.pause.lock() {
            *guard = handle;
        }
    }

    fn readiness(&self) -> Readiness {
        Readiness::new(self.settings.sandbox.ready_attempts)
            .with_interval(self.settings.probe_interval)
    }

    fn pacing(&self) -> Pacing {
        Pacing {
            char_delay: self.settings.char_delay,
            line_delay: self.settings.line_delay,
        }
    }

    fn ensure_open(&self) -> TutorResult<()> {
        if self.is_closed() {
            Err(TutorError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::BuiltinCourse;
    use crate::session::testing::{BrokenInput, FakeEngine};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;
    use std::time::Duration;

    struct StaticCourses {
        course: Value,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl CourseSource for StaticCourses {
        async fn fetch(&self, course_id: &str) -> TutorResult<Value> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if course_id == "7" {
                Ok(self.course.clone())
            } else {
                Err(TutorError::CourseNotFound(course_id.to_string()))
            }
        }
    }

    fn course() -> Value {
        json!({
            "lessons": [
                {"title": "intro"},
                {"title": "files", "script": ["ls"]},
                {"title": "pipes", "steps": [
                    {"text": "grep", "script": ["printf 'a\\nb\\n' | grep b", "echo done"]},
                    {"text": "no script"}
                ]}
            ]
        })
    }

    /// Stand-in for `ssh`: announces its arguments, then echoes stdin.
    fn fake_ssh() -> &'static PathBuf {
        static SCRIPT: OnceLock<(tempfile::TempDir, PathBuf)> = OnceLock::new();
        &SCRIPT
            .get_or_init(|| {
                use std::os::unix::fs::PermissionsExt;
                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join("fake-ssh");
                std::fs::write(&path, "#!/bin/sh\necho \"connected: $*\"\nexec cat\n").unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                (dir, path)
            })
            .1
    }

    fn settings() -> SessionSettings {
        let mut settings = SessionSettings::default();
        settings.sandbox.ready_attempts = 5;
        settings.probe_interval = Duration::from_millis(10);
        settings.char_delay = Duration::from_millis(5);
        settings.line_delay = Duration::from_millis(5);
        settings.terminal.ssh_program = fake_ssh().display().to_string();
        settings
    }

    fn controller(engine: &FakeEngine) -> (SessionController, Arc<StaticCourses>) {
        let courses = Arc::new(StaticCourses {
            course: course(),
            fetches: AtomicUsize::new(0),
        });
        let session = SessionController::new(
            "test-session".into(),
            settings(),
            Arc::new(engine.clone()),
            courses.clone(),
        );
        (session, courses)
    }

    async fn started(engine: &FakeEngine) -> SessionController {
        let (session, _) = controller(engine);
        session.get_course("7").await.unwrap();
        assert_eq!(session.start().await.unwrap(), Status::Ready);
        session
    }

    fn tutor_sandboxes(engine: &FakeEngine) -> Vec<String> {
        engine
            .listening()
            .into_iter()
            .filter(|name| name.contains("-tutor-"))
            .collect()
    }

    /// Read from `rx` until `needle` shows up.
    async fn expect_output(rx: &mut mpsc::Receiver<String>, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(chunk)) => seen.push_str(&chunk),
                _ => panic!("{needle:?} never appeared, got {seen:?}"),
            }
        }
        seen
    }

    async fn expect_closed(rx: &mut mpsc::Receiver<String>) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => panic!("terminal stream did not end"),
            }
        }
    }

    #[tokio::test]
    async fn start_navigate_and_restart_tutor() {
        let engine = FakeEngine::new();
        let session = started(&engine).await;

        let pos = session.position().await.unwrap().unwrap();
        assert_eq!((pos.n, pos.outof, pos.lesson), (1, 3, 1));
        assert_eq!(engine.count("create"), 2);
        let old_tutor = tutor_sandboxes(&engine).pop().unwrap();

        // Entering lesson 2 replaces the tutor sandbox before returning.
        let pos = session.next().await.unwrap();
        assert_eq!((pos.n, pos.lesson), (2, 2));
        let tutors = tutor_sandboxes(&engine);
        assert_eq!(tutors.len(), 1);
        assert_ne!(tutors[0], old_tutor);
        assert!(engine.calls().contains(&format!("stop {old_tutor}")));
        assert_eq!(engine.count("create"), 3);

        assert!(matches!(session.seek(0).await, Err(TutorError::InvalidLesson(0))));
        assert_eq!(session.position().await.unwrap().unwrap().n, 2);

        // Moving between steps of the same lesson keeps the sandbox.
        let pos = session.seek(3).await.unwrap();
        assert_eq!((pos.n, pos.lesson), (3, 2));
        assert_eq!(engine.count("create"), 3);
        assert!(matches!(session.seek(4).await, Err(TutorError::OutOfRange)));

        session.back().await.unwrap();
        let pos = session.back().await.unwrap();
        assert_eq!((pos.n, pos.lesson), (1, 1));
        assert_eq!(engine.count("create"), 4);
        assert!(matches!(session.back().await, Err(TutorError::OutOfRange)));
        assert_eq!(session.position().await.unwrap().unwrap().n, 1);

        session.destroy().await;
        assert_eq!(engine.open_clients(), 0);
        assert!(engine.listening().is_empty());
    }

    #[tokio::test]
    async fn start_without_course() {
        let engine = FakeEngine::new();
        let (session, _) = controller(&engine);
        assert_eq!(session.start().await.unwrap(), Status::CourseDoesNotExist);
        assert_eq!(engine.count("create"), 0);
    }

    #[tokio::test]
    async fn empty_course_fails_to_start() {
        let engine = FakeEngine::new();
        let session = SessionController::new(
            "empty".into(),
            settings(),
            Arc::new(engine.clone()),
            Arc::new(StaticCourses {
                course: json!({"lessons": [{"title": "intro only"}]}),
                fetches: AtomicUsize::new(0),
            }),
        );
        session.get_course("7").await.unwrap();
        assert_eq!(session.start().await.unwrap(), Status::Failed);
        assert!(session.position().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn course_is_fetched_once() {
        let engine = FakeEngine::new();
        let (session, courses) = controller(&engine);

        assert!(matches!(
            session.get_course("8").await,
            Err(TutorError::CourseNotFound(_))
        ));
        let first = session.get_course("7").await.unwrap();
        let second = session.get_course("7").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(courses.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn readiness_timeout_fails_start_and_releases_sandboxes() {
        let engine = FakeEngine::new();
        engine.bind_ports(false);
        let (session, _) = controller(&engine);
        session.get_course("7").await.unwrap();

        assert_eq!(session.start().await.unwrap(), Status::Failed);
        assert_eq!(engine.open_clients(), 0);
        assert!(matches!(session.next().await, Err(TutorError::NotStarted)));

        // A retry once the sandboxes come up succeeds.
        engine.bind_ports(true);
        assert_eq!(session.start().await.unwrap(), Status::Ready);
        assert_eq!(session.start().await.unwrap(), Status::Ready);
        assert_eq!(engine.count("create"), 4);
        session.destroy().await;
    }

    #[tokio::test]
    async fn navigation_timeout_reverts_cursor_and_keeps_new_sandbox() {
        let engine = FakeEngine::new();
        let session = started(&engine).await;

        engine.bind_ports(false);
        let err = session.next().await.unwrap_err();
        assert!(matches!(err, TutorError::Timeout { attempts: 5, .. }));
        assert!(!err.is_session_fatal());
        assert_eq!(session.position().await.unwrap().unwrap().n, 1);
        assert_eq!(engine.count("create"), 3);
        assert_eq!(engine.open_clients(), 2);

        session.destroy().await;
        assert_eq!(engine.open_clients(), 0);
    }

    #[tokio::test]
    async fn failed_lesson_change_relaunches_tutor_on_next_move() {
        let engine = FakeEngine::new();
        let session = SessionController::new(
            "relaunch".into(),
            settings(),
            Arc::new(engine.clone()),
            Arc::new(BuiltinCourse),
        );
        assert_eq!(session.start().await.unwrap(), Status::Ready);

        // Entry 4 opens lesson 2; its tutor never comes up.
        engine.bind_ports(false);
        assert!(matches!(session.seek(4).await, Err(TutorError::Timeout { .. })));
        assert_eq!(session.position().await.unwrap().unwrap().n, 1);
        engine.bind_ports(true);

        // Staying inside lesson 1 still brings back a lesson 1 tutor.
        let pos = session.next().await.unwrap();
        assert_eq!((pos.n, pos.lesson), (2, 1));
        assert_eq!(engine.count("create"), 4);
        let tutors = tutor_sandboxes(&engine);
        assert_eq!(tutors.len(), 1);
        assert!(engine.env_of(&tutors[0]).contains(&"TIT_LESSON=1".to_string()));

        // Healthy again, so steps of the same lesson keep it.
        session.next().await.unwrap();
        assert_eq!(engine.count("create"), 4);

        session.destroy().await;
    }

    #[tokio::test]
    async fn sandbox_start_failure_is_fatal() {
        let engine = FakeEngine::new();
        engine.fail_starts(true);
        let (session, _) = controller(&engine);
        session.get_course("7").await.unwrap();

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, TutorError::SandboxStart(_)));
        assert!(err.is_session_fatal());
        assert_eq!(engine.open_clients(), 0);
    }

    #[tokio::test]
    async fn calls_before_start() {
        let engine = FakeEngine::new();
        let (session, _) = controller(&engine);
        let (tx, _rx) = mpsc::channel(4);

        assert!(matches!(session.next().await, Err(TutorError::NotStarted)));
        assert!(matches!(session.seek(1).await, Err(TutorError::NotStarted)));
        assert!(matches!(
            session.open_terminal(Role::Student, tx).await,
            Err(TutorError::NotStarted)
        ));
        assert!(matches!(session.show_me_how().await, Err(TutorError::NotStarted)));
        assert!(matches!(
            session.enter("ls\n".into()).await,
            Err(TutorError::TerminalNotOpen(_))
        ));
        assert!(session.pause().is_ok());
        assert!(session.position().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminals_stream_and_accept_input() {
        let engine = FakeEngine::new();
        let session = started(&engine).await;

        let (tx, mut rx) = mpsc::channel(16);
        session.open_terminal(Role::Student, tx).await.unwrap();
        let banner = expect_output(&mut rx, "student@127.0.0.1").await;
        assert!(banner.contains("StrictHostKeyChecking=no"));

        session.enter("echo hi\n".into()).await.unwrap();
        expect_output(&mut rx, "echo hi").await;

        session.destroy().await;
        expect_closed(&mut rx).await;
        assert!(matches!(
            session.enter("ls\n".into()).await,
            Err(TutorError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn failed_student_write_destroys_session() {
        let engine = FakeEngine::new();
        let session = started(&engine).await;
        session
            .attach_terminal(Terminal::detached(Role::Student, Box::new(BrokenInput)))
            .await;

        let err = session.enter("ls\n".into()).await.unwrap_err();
        assert!(matches!(err, TutorError::TerminalWrite(_)));
        assert!(err.is_session_fatal());
        assert!(session.is_closed());
        assert_eq!(engine.count("stop"), 2);
        assert!(engine.listening().is_empty());
        assert_eq!(engine.open_clients(), 0);
        assert!(matches!(session.next().await, Err(TutorError::SessionClosed)));
    }

    #[tokio::test]
    async fn reopening_a_terminal_replaces_it() {
        let engine = FakeEngine::new();
        let session = started(&engine).await;

        let (first_tx, mut first) = mpsc::channel(16);
        session.open_terminal(Role::Tutor, first_tx).await.unwrap();
        expect_output(&mut first, "connected").await;

        let (second_tx, mut second) = mpsc::channel(16);
        session.open_terminal(Role::Tutor, second_tx).await.unwrap();
        expect_closed(&mut first).await;
        expect_output(&mut second, "tutor@127.0.0.1").await;

        session.destroy().await;
    }

    #[tokio::test]
    async fn show_me_how_types_the_current_script() {
        let engine = FakeEngine::new();
        let session = started(&engine).await;

        assert!(matches!(
            session.show_me_how().await,
            Err(TutorError::TerminalNotOpen(_))
        ));

        let (tx, mut rx) = mpsc::channel(64);
        session.open_terminal(Role::Tutor, tx).await.unwrap();
        expect_output(&mut rx, "tutor@127.0.0.1").await;

        assert_eq!(session.show_me_how().await.unwrap(), Status::EndOfScript);
        expect_output(&mut rx, "ls").await;

        session.destroy().await;
    }

    #[tokio::test]
    async fn pause_interrupts_and_navigation_discards_autopilot() {
        let engine = FakeEngine::new();
        let mut settings = settings();
        settings.char_delay = Duration::from_millis(50);
        let session = Arc::new(SessionController::new(
            "pause".into(),
            settings,
            Arc::new(engine.clone()),
            Arc::new(StaticCourses {
                course: course(),
                fetches: AtomicUsize::new(0),
            }),
        ));
        session.get_course("7").await.unwrap();
        session.start().await.unwrap();
        session.seek(2).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        session.open_terminal(Role::Tutor, tx).await.unwrap();
        expect_output(&mut rx, "connected").await;

        let playing = tokio::spawn({
            let session = session.clone();
            async move { session.show_me_how().await }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            session.show_me_how().await,
            Err(TutorError::AutopilotBusy)
        ));
        session.pause().unwrap();
        assert_eq!(playing.await.unwrap().unwrap(), Status::ScriptPaused);

        // Same lesson, so the terminal survives, but the bot is gone and
        // entry 3 has no script.
        session.next().await.unwrap();
        assert_eq!(session.show_me_how().await.unwrap(), Status::EndOfScript);

        session.destroy().await;
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let engine = FakeEngine::new();
        let session = started(&engine).await;

        session.destroy().await;
        session.destroy().await;
        assert!(session.is_closed());
        assert_eq!(engine.count("remove"), 2);
        assert!(matches!(session.start().await, Err(TutorError::SessionClosed)));
        assert!(matches!(session.pause(), Err(TutorError::SessionClosed)));
    }
}
