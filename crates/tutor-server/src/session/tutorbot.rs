//! Scripted autopilot: types command lines into a terminal at a humanlike pace.

use super::pty::PtyWriter;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delays between typed characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Pause after an ordinary character.
    pub char_delay: Duration,
    /// Pause after the newline that ends a line.
    pub line_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            char_delay: Duration::from_millis(200),
            line_delay: Duration::from_secs(1),
        }
    }
}

/// How a playback attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Every line was typed; the next play starts from the top.
    EndOfScript,
    /// Stopped by [`PauseHandle::pause`]; the next play resumes here.
    Paused,
    /// The terminal rejected a write.
    Aborted,
}

/// Where the autopilot types.
#[async_trait]
pub trait TypingTarget: Send {
    async fn type_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl TypingTarget for PtyWriter {
    async fn type_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_async(bytes.to_vec()).await
    }
}

/// Shared pause flag, usable while the bot itself is busy playing.
#[derive(Debug, Clone, Default)]
pub struct PauseHandle(Arc<AtomicBool>);

impl PauseHandle {
    /// Stop the running playback before its next character.
    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Tutorbot {
    script: Vec<Vec<char>>,
    row: usize,
    col: usize,
    pacing: Pacing,
    pause: PauseHandle,
}

impl Tutorbot {
    pub fn new<I, S>(script: I, pacing: Pacing) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            script: script
                .into_iter()
                .map(|line| line.as_ref().chars().collect())
                .collect(),
            row: 0,
            col: 0,
            pacing,
            pause: PauseHandle::default(),
        }
    }

    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// Clear the pause flag ahead of [`run`](Self::run).
    pub fn resume(&self) {
        self.pause.clear();
    }

    /// Resume and play until the script ends, a pause lands, or a write fails.
    pub async fn play<T: TypingTarget + ?Sized>(&mut self, out: &mut T) -> PlayOutcome {
        self.resume();
        self.run(out).await
    }

    /// Play from the current position without touching the pause flag.
    pub async fn run<T: TypingTarget + ?Sized>(&mut self, out: &mut T) -> PlayOutcome {
        loop {
            if self.pause.is_paused() {
                debug!(row = self.row, col = self.col, "autopilot paused");
                return PlayOutcome::Paused;
            }

            let Some((ch, end_of_line)) = self.advance() else {
                self.rewind();
                return PlayOutcome::EndOfScript;
            };

            let mut buf = [0u8; 4];
            let bytes = ch.encode_utf8(&mut buf).as_bytes();
            if let Err(e) = out.type_bytes(bytes).await {
                debug!(error = %e, "autopilot write failed");
                return PlayOutcome::Aborted;
            }

            if self.is_exhausted() {
                self.rewind();
                return PlayOutcome::EndOfScript;
            }

            let delay = if end_of_line {
                self.pacing.line_delay
            } else {
                self.pacing.char_delay
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Next character to type; the end of a line yields `'\n'`.
    fn advance(&mut self) -> Option<(char, bool)> {
        let line = self.script.get(self.row)?;
        match line.get(self.col) {
            Some(&ch) => {
                self.col += 1;
                Some((ch, false))
            }
            None => {
                self.row += 1;
                self.col = 0;
                Some(('\n', true))
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.row >= self.script.len()
    }

    fn rewind(&mut self) {
        self.row = 0;
        self.col = 0;
    }
}
