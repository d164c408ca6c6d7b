//! In-memory container runtime for tests.
//!
//! A started fake sandbox binds a loopback listener on the port from its
//! `PORT=` variable, so readiness probes behave as they would against a
//! real container.

use super::sandbox::{ContainerApi, SandboxEngine, SandboxSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tutor_core::{TutorError, TutorResult};

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<String>>,
    listeners: Mutex<HashMap<String, TcpListener>>,
    envs: Mutex<HashMap<String, Vec<String>>>,
    open_clients: AtomicUsize,
    fail_starts: AtomicBool,
    skip_bind: AtomicBool,
}

impl Shared {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeEngine {
    shared: Arc<Shared>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `start` fail.
    pub fn fail_starts(&self, on: bool) {
        self.shared.fail_starts.store(on, Ordering::SeqCst);
    }

    /// Whether started sandboxes listen on their port (default: yes).
    pub fn bind_ports(&self, on: bool) {
        self.shared.skip_bind.store(!on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.shared.calls.lock().unwrap().clone()
    }

    /// Number of calls of one kind (`"create"`, `"stop"`, ...).
    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{op} ");
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    pub fn open_clients(&self) -> usize {
        self.shared.open_clients.load(Ordering::SeqCst)
    }

    /// Environment a sandbox was created with.
    pub fn env_of(&self, name: &str) -> Vec<String> {
        self.shared
            .envs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of sandboxes currently listening.
    pub fn listening(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.listeners.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SandboxEngine for FakeEngine {
    async fn connect(&self) -> TutorResult<Box<dyn ContainerApi>> {
        self.shared.open_clients.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeApi {
            shared: self.shared.clone(),
            specs: Mutex::new(HashMap::new()),
        }))
    }
}

struct FakeApi {
    shared: Arc<Shared>,
    specs: Mutex<HashMap<String, SandboxSpec>>,
}

#[async_trait]
impl ContainerApi for FakeApi {
    async fn create(&self, name: &str, spec: &SandboxSpec) -> TutorResult<()> {
        self.shared.record(format!("create {name}"));
        self.specs.lock().unwrap().insert(name.to_string(), spec.clone());
        self.shared
            .envs
            .lock()
            .unwrap()
            .insert(name.to_string(), spec.env.clone());
        Ok(())
    }

    async fn start(&self, name: &str) -> TutorResult<()> {
        self.shared.record(format!("start {name}"));
        if self.shared.fail_starts.load(Ordering::SeqCst) {
            return Err(TutorError::SandboxStart(format!("{name}: image not found")));
        }
        if self.shared.skip_bind.load(Ordering::SeqCst) {
            return Ok(());
        }
        let port = self
            .specs
            .lock()
            .unwrap()
            .get(name)
            .and_then(|spec| spec.port())
            .ok_or_else(|| TutorError::SandboxStart(format!("{name}: no port")))?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        self.shared
            .listeners
            .lock()
            .unwrap()
            .insert(name.to_string(), listener);
        Ok(())
    }

    async fn stop(&self, name: &str) -> TutorResult<()> {
        self.shared.record(format!("stop {name}"));
        self.shared.listeners.lock().unwrap().remove(name);
        Ok(())
    }

    async fn remove(&self, name: &str) -> TutorResult<()> {
        self.shared.record(format!("remove {name}"));
        Ok(())
    }
}

impl Drop for FakeApi {
    fn drop(&mut self) {
        self.shared.open_clients.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Terminal input that fails every write, like a pty whose shell has died.
pub(crate) struct BrokenInput;

impl Write for BrokenInput {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(5))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
