//! Per-connection session: sandboxes, terminals, curriculum, autopilot.

pub mod controller;
pub mod navigator;
pub mod pty;
pub mod sandbox;
pub mod tutorbot;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::SessionController;
pub use sandbox::{DockerEngine, SandboxEngine};

/// Random 128-bit identifier, hex encoded.
pub(crate) fn generate_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
