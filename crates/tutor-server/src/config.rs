//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tutor_core::{Role, TutorError, TutorResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub course: CourseSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub tutorbot: TutorbotSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[course]` section: where curricula come from.
#[derive(Debug, Clone, Deserialize)]
pub struct CourseSection {
    /// Base URL of the course API. Unset means the built-in curriculum.
    #[serde(default)]
    pub api_host: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for CourseSection {
    fn default() -> Self {
        Self {
            api_host: None,
            request_timeout: default_request_timeout(),
        }
    }
}

/// `[sandbox]` section: container images, limits and readiness polling.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_image")]
    pub student_image: String,
    #[serde(default = "default_image")]
    pub tutor_image: String,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpu_fraction")]
    pub cpu_fraction: f64,
    /// Ephemeral storage quota, e.g. `"1G"`. Needs a storage driver that supports it.
    #[serde(default)]
    pub storage_size: Option<String>,
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_true")]
    pub restart_on_lesson_change: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            student_image: default_image(),
            tutor_image: default_image(),
            network_mode: default_network_mode(),
            memory_mb: default_memory_mb(),
            cpu_fraction: default_cpu_fraction(),
            storage_size: None,
            ready_attempts: default_ready_attempts(),
            name_prefix: default_name_prefix(),
            restart_on_lesson_change: true,
        }
    }
}

/// `[terminal]` section: how the remote shell is reached.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
    #[serde(default = "default_ssh_host")]
    pub host: String,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            ssh_program: default_ssh_program(),
            host: default_ssh_host(),
        }
    }
}

/// `[tutorbot]` section: autopilot typing pace.
#[derive(Debug, Clone, Deserialize)]
pub struct TutorbotSection {
    #[serde(default = "default_char_delay_ms")]
    pub char_delay_ms: u64,
    #[serde(default = "default_line_delay_ms")]
    pub line_delay_ms: u64,
}

impl Default for TutorbotSection {
    fn default() -> Self {
        Self {
            char_delay_ms: default_char_delay_ms(),
            line_delay_ms: default_line_delay_ms(),
        }
    }
}

fn default_port() -> u16 {
    8000
}
fn default_max_sessions() -> usize {
    100
}
fn default_request_timeout() -> u64 {
    10
}
fn default_image() -> String {
    "tutorin.tech/student-tutor-alpine".to_string()
}
fn default_network_mode() -> String {
    "host".to_string()
}
/// Upper bound on `sandbox.memory_mb` (1 TiB).
pub const MAX_MEMORY_MB: u64 = 1024 * 1024;

fn default_memory_mb() -> u64 {
    256
}
fn default_cpu_fraction() -> f64 {
    0.5
}
fn default_ready_attempts() -> u32 {
    30
}
fn default_name_prefix() -> String {
    "tit".to_string()
}
fn default_ssh_program() -> String {
    "ssh".to_string()
}
fn default_ssh_host() -> String {
    "127.0.0.1".to_string()
}
fn default_char_delay_ms() -> u64 {
    200
}
fn default_line_delay_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_sessions: usize,
    pub api_host: Option<String>,
    pub request_timeout: Duration,
    pub session: SessionSettings,
}

/// Everything a single session needs to run.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub sandbox: SandboxSection,
    pub terminal: TerminalSection,
    pub char_delay: Duration,
    pub line_delay: Duration,
    /// Spacing between readiness probes.
    pub probe_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let tutorbot = TutorbotSection::default();
        Self {
            sandbox: SandboxSection::default(),
            terminal: TerminalSection::default(),
            char_delay: Duration::from_millis(tutorbot.char_delay_ms),
            line_delay: Duration::from_millis(tutorbot.line_delay_ms),
            probe_interval: crate::net::DEFAULT_PROBE_INTERVAL,
        }
    }
}

impl SessionSettings {
    /// Base image for a role's sandbox.
    pub fn image_for(&self, role: Role) -> &str {
        match role {
            Role::Student => &self.sandbox.student_image,
            Role::Tutor => &self.sandbox.tutor_image,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_api_host: Option<&str>,
        cli_max_sessions: Option<usize>,
    ) -> TutorResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TutorError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(file_config, cli_port, cli_api_host, cli_max_sessions)
    }

    fn from_file(
        file: ConfigFile,
        cli_port: Option<u16>,
        cli_api_host: Option<&str>,
        cli_max_sessions: Option<usize>,
    ) -> TutorResult<Self> {
        let sandbox = file.sandbox;
        if sandbox.cpu_fraction.is_nan() || sandbox.cpu_fraction <= 0.0 {
            return Err(TutorError::Config(format!(
                "sandbox.cpu_fraction must be positive, got {}",
                sandbox.cpu_fraction
            )));
        }
        if sandbox.memory_mb == 0 || sandbox.memory_mb > MAX_MEMORY_MB {
            return Err(TutorError::Config(format!(
                "sandbox.memory_mb must be between 1 and {MAX_MEMORY_MB}, got {}",
                sandbox.memory_mb
            )));
        }
        if sandbox.ready_attempts == 0 {
            return Err(TutorError::Config(
                "sandbox.ready_attempts must be at least 1".into(),
            ));
        }

        let api_host = cli_api_host
            .map(|s| s.to_string())
            .or(file.course.api_host)
            .filter(|s| !s.is_empty());

        Ok(Self {
            port: cli_port.unwrap_or(file.server.port),
            max_sessions: cli_max_sessions.unwrap_or(file.server.max_sessions),
            api_host,
            request_timeout: Duration::from_secs(file.course.request_timeout),
            session: SessionSettings {
                sandbox,
                terminal: file.terminal,
                char_delay: Duration::from_millis(file.tutorbot.char_delay_ms),
                line_delay: Duration::from_millis(file.tutorbot.line_delay_ms),
                probe_interval: crate::net::DEFAULT_PROBE_INTERVAL,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
