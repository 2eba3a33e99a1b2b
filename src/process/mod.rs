//! Host application process control.
//!
//! `ProcessController` is the seam the switch engine drives: find the host,
//! ask it to quit, kill it if it will not, and start it again. The real
//! implementation lives in `system`; tests substitute fakes.

pub mod matcher;
pub mod system;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

pub use matcher::HostMatcher;
pub use system::{GracefulStop, SystemController};

/// The running host: every matching process found by one discovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub name: String,
    pub pids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every process exited (or none was running) within the timeout.
    GracefullyStopped,
    /// Timed out; these are still alive and the caller should escalate.
    StillRunning(ProcessHandle),
}

/// How to bring the host back up.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Direct-launch candidates, first existing one wins.
    pub executables: Vec<PathBuf>,
    /// Bare command name looked up on PATH when no candidate exists.
    pub path_command: Option<String>,
    /// Handed to the desktop URI handler when no executable can be started.
    pub uri: Option<String>,
    /// How long to wait for the host to show up after launching.
    pub confirm_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMethod {
    Executable(PathBuf),
    Uri(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub method: LaunchMethod,
    /// None when the host had not appeared by the end of the confirm window.
    pub handle: Option<ProcessHandle>,
}

pub trait ProcessController: Send + Sync {
    /// Find the running host. Side-effect free.
    fn discover(&self) -> Option<ProcessHandle>;

    /// Ask the host to quit and wait up to `timeout` for it to exit.
    /// Stopping something already gone is success.
    fn stop(&self, handle: &ProcessHandle, timeout: Duration) -> Result<StopOutcome>;

    /// Kill unconditionally. Processes that already exited are not an error.
    fn force_stop(&self, handle: &ProcessHandle) -> Result<()>;

    fn start(&self, spec: &LaunchSpec) -> Result<Launch>;
}
