//! Terminal bridge using portable-pty.
//!
//! Spawns a remote-shell client on a fresh pseudo-terminal, streams its
//! output into a channel and forwards input to it.

use crate::config::TerminalSection;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tutor_core::{Role, TutorError, TutorResult};

/// Bytes requested per read from the pty master.
pub const READ_BUF_SIZE: usize = 64 * 1024;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Program and arguments run inside the pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalCommand {
    program: String,
    args: Vec<String>,
}

impl TerminalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `ssh` into a role's sandbox with host-key checks and log noise off.
    pub fn ssh(terminal: &TerminalSection, role: Role, port: u16) -> Self {
        Self::new(&terminal.ssh_program)
            .arg("-o")
            .arg("LogLevel=quiet")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-p")
            .arg(port.to_string())
            .arg(format!("{role}@{}", terminal.host))
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut builder = CommandBuilder::new(&self.program);
        builder.args(&self.args);
        builder.env("TERM", "xterm-256color");
        builder
    }
}

/// Cloneable handle onto the pty input.
#[derive(Clone)]
pub struct PtyWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl PtyWriter {
    /// Write and flush `bytes` on the blocking pool.
    pub async fn write_async(&self, bytes: Vec<u8>) -> io::Result<()> {
        let mut writer = self.clone();
        tokio::task::spawn_blocking(move || {
            writer.write_all(&bytes)?;
            writer.flush()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

impl Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pty writer lock poisoned"))?;
        writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut writer = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pty writer lock poisoned"))?;
        writer.flush()
    }
}

/// A remote-shell process attached to a pty master.
pub struct Terminal {
    role: Role,
    writer: PtyWriter,
    reader: Option<Box<dyn Read + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    /// Keeps the pty open for as long as the terminal lives.
    _master: Option<Box<dyn MasterPty + Send>>,
}

impl Terminal {
    /// Spawn `command` on a new pseudo-terminal. Returns without waiting
    /// for the remote side.
    pub fn open(role: Role, command: &TerminalCommand) -> TutorResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TutorError::TerminalOpen(format!("failed to open pty: {e}")))?;

        let child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(|e| {
                TutorError::TerminalOpen(format!("failed to spawn {}: {e}", command.program))
            })?;
        // The child holds its own copy; ours would keep reads from ever seeing EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TutorError::TerminalOpen(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TutorError::TerminalOpen(format!("failed to take pty writer: {e}")))?;

        info!(role = %role, program = %command.program, pid = ?child.process_id(), "terminal opened");

        Ok(Self {
            role,
            writer: PtyWriter(Arc::new(Mutex::new(writer))),
            reader: Some(reader),
            child: Some(child),
            _master: Some(pair.master),
        })
    }

    /// A terminal with no process behind it, feeding input to `writer`.
    #[cfg(test)]
    pub(crate) fn detached(role: Role, writer: Box<dyn Write + Send>) -> Self {
        Self {
            role,
            writer: PtyWriter(Arc::new(Mutex::new(writer))),
            reader: None,
            child: None,
            _master: None,
        }
    }

    /// Start pushing decoded output into `sink`. Only one reader per terminal.
    ///
    /// The reader runs on the blocking pool and ends quietly on EOF, on a
    /// read error, or once `sink` is dropped.
    pub fn register_reader(&mut self, sink: mpsc::Sender<String>) -> TutorResult<()> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| TutorError::TerminalOpen(format!("{} reader already taken", self.role)))?;
        let role = self.role;
        tokio::task::spawn_blocking(move || pump(reader, sink, role));
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Input side of the pty. Its `Write` impl blocks; async callers go
    /// through [`PtyWriter::write_async`].
    pub fn writer(&self) -> PtyWriter {
        self.writer.clone()
    }

    /// Kill the shell process and reap it. The reader then drains to EOF.
    pub async fn close(mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.kill() {
            debug!(role = %self.role, error = %e, "kill failed, child probably exited");
        }
        let role = self.role;
        match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => info!(role = %role, code = status.exit_code(), "terminal closed"),
            Ok(Err(e)) => warn!(role = %role, error = %e, "failed to reap terminal process"),
            Err(e) => warn!(role = %role, error = %e, "join error while closing terminal"),
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.try_wait();
            debug!(role = %self.role, "terminal dropped, child killed");
        }
    }
}

fn pump(mut reader: Box<dyn Read + Send>, sink: mpsc::Sender<String>, role: Role) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut chunker = Utf8Chunker::default();

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = chunker.push(&buf[..n]);
                if text.is_empty() {
                    continue;
                }
                if sink.blocking_send(text).is_err() {
                    debug!(role = %role, "terminal sink closed, reader stopping");
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the child has gone away.
                debug!(role = %role, error = %e, "terminal read ended");
                break;
            }
        }
    }

    let rest = chunker.finish();
    if !rest.is_empty() {
        let _ = sink.blocking_send(rest);
    }
    debug!(role = %role, "terminal reader finished");
}

/// Decodes a byte stream as UTF-8, carrying sequences split across reads.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    /// Append bytes and return everything decodable so far. Invalid bytes
    /// become U+FFFD; an incomplete trailing sequence is held back.
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is left at end of stream.
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
