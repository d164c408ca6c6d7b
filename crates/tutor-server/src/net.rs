//! Ephemeral port allocation and TCP readiness polling.
//!
//! Sandboxes bind their SSH service to a port chosen here; the controller
//! then polls that port until it accepts connections. This is a coarse
//! reachability signal, not a handshake with the service itself.

use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};
use tutor_core::{TutorError, TutorResult};

/// Default spacing between readiness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Allocate an available port.
///
/// The probe socket is released before returning, so the port may be taken
/// by someone else before the sandbox binds it. The window is small and the
/// race is accepted.
pub fn allocate_port() -> TutorResult<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    debug!(port, "allocated port");
    Ok(port)
}

/// Bounded readiness poller for a loopback TCP port.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    /// Number of connect attempts before giving up.
    pub attempts: u32,
    /// Delay after each refused attempt.
    pub interval: Duration,
}

impl Readiness {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wait until `127.0.0.1:port` accepts a TCP connection.
    ///
    /// The probe connection is closed immediately on success. Fails with
    /// [`TutorError::Timeout`] once every attempt has been refused.
    pub async fn wait(&self, port: u16) -> TutorResult<()> {
        for attempt in 1..=self.attempts {
            match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
                Ok(stream) => {
                    drop(stream);
                    info!(port, attempt, "port is ready");
                    return Ok(());
                }
                Err(e) => {
                    debug!(port, attempt, error = %e, "port not ready yet");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }

        Err(TutorError::Timeout {
            port,
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn allocated_ports_are_bindable() {
        let port = allocate_port().unwrap();
        assert_ne!(port, 0);
        // Nothing holds the port after allocation.
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[tokio::test]
    async fn ready_when_listening() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let readiness = Readiness::new(3).with_interval(Duration::from_millis(10));
        readiness.wait(port).await.unwrap();
    }

    #[tokio::test]
    async fn times_out_after_configured_attempts() {
        let port = allocate_port().unwrap();
        let interval = Duration::from_millis(30);
        let readiness = Readiness::new(4).with_interval(interval);

        let started = Instant::now();
        let err = readiness.wait(port).await.unwrap_err();

        match err {
            TutorError::Timeout { port: p, attempts } => {
                assert_eq!(p, port);
                assert_eq!(attempts, 4);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= interval * 4);
    }

    #[tokio::test]
    async fn listener_appearing_partway_is_detected() {
        let port = allocate_port().unwrap();
        let readiness = Readiness::new(50).with_interval(Duration::from_millis(20));

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
                .await
                .unwrap();
            // Keep accepting so the probe completes.
            let _ = listener.accept().await;
        });

        readiness.wait(port).await.unwrap();
        late.abort();
    }
}
