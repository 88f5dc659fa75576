//! Process-wide runtime configuration resolved once at startup from the
//! environment and the invoking UID. There is no persistent settings file:
//! each plugin invocation is a fresh process whose operational parameters
//! come from the CNI stdin JSON or from here, never both.

use std::env;
use std::path::PathBuf;

use nix::unistd::Uid;

pub const PROGRAM_NAME: &str = "vni-ptp-cni";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Term,
    Json,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub program_name: &'static str,
    pub state_root: Option<PathBuf>,
    pub log_level: slog::Level,
    pub log_format: LogFormat,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        RuntimeConfig {
            program_name: PROGRAM_NAME,
            state_root: env::var_os("VNI_STATE_ROOT").map(PathBuf::from),
            log_level: parse_level(env::var("VNI_LOG_LEVEL").ok().as_deref()),
            log_format: if atty_stderr() {
                LogFormat::Term
            } else {
                LogFormat::Json
            },
        }
    }

    /// Root directory for the registry and cache, honoring the UID split
    /// described for persisted state: root gets `/run/<program>`, everyone
    /// else gets `/run/user/<uid>/<program>`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(root) = &self.state_root {
            return root.clone();
        }
        let uid = Uid::current();
        if uid.is_root() {
            PathBuf::from("/run").join(self.program_name)
        } else {
            PathBuf::from("/run/user")
                .join(uid.to_string())
                .join(self.program_name)
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        env::temp_dir().join(format!("{}.lock", self.program_name))
    }
}

fn parse_level(raw: Option<&str>) -> slog::Level {
    match raw.unwrap_or("info").to_ascii_lowercase().as_str() {
        "trace" => slog::Level::Trace,
        "debug" => slog::Level::Debug,
        "warn" | "warning" => slog::Level::Warning,
        "error" => slog::Level::Error,
        "crit" | "critical" => slog::Level::Critical,
        _ => slog::Level::Info,
    }
}

fn atty_stderr() -> bool {
    nix::unistd::isatty(std::io::stderr().into_raw_fd_check()).unwrap_or(false)
}

/// Small shim so `atty_stderr` above reads naturally; `isatty` needs a raw fd.
trait IntoRawFdCheck {
    fn into_raw_fd_check(self) -> std::os::fd::RawFd;
}

impl IntoRawFdCheck for std::io::Stderr {
    fn into_raw_fd_check(self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}
