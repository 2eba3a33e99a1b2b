//! Real process control on top of sysinfo.
//!
//! Graceful stop uses the most cooperative request each platform offers:
//! - macOS: AppleScript `quit`, then SIGTERM for anything still around
//! - Windows: `taskkill /IM <name>.exe /T` without /F
//! - Linux: SIGTERM
//!
//! Forced stop is SIGKILL / TerminateProcess through sysinfo.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, Signal, System};

use super::{HostMatcher, Launch, LaunchMethod, LaunchSpec, ProcessController, ProcessHandle, StopOutcome};
use crate::error::{Error, Result};
use crate::platform::{self, Platform};

/// Cooperative termination request, one variant per platform family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulStop {
    AppleScript { app: String },
    TaskKill { image: String },
    Terminate,
}

impl GracefulStop {
    pub fn for_platform(platform: Platform, host_name: &str) -> Self {
        match platform {
            Platform::MacOS => GracefulStop::AppleScript {
                app: host_name.to_string(),
            },
            Platform::Windows => GracefulStop::TaskKill {
                image: format!("{host_name}.exe"),
            },
            Platform::Linux | Platform::Unknown => GracefulStop::Terminate,
        }
    }
}

pub struct SystemController {
    matcher: HostMatcher,
    graceful: GracefulStop,
    platform: Platform,
    poll_interval: Duration,
    /// run as `<opener> <uri>` instead of the platform's opener
    uri_opener: Option<PathBuf>,
}

impl SystemController {
    pub fn new(matcher: HostMatcher, platform: Platform, poll_interval: Duration) -> Self {
        let graceful = GracefulStop::for_platform(platform, matcher.name());
        SystemController {
            matcher,
            graceful,
            platform,
            poll_interval,
            uri_opener: None,
        }
    }

    pub fn with_uri_opener(mut self, opener: Option<PathBuf>) -> Self {
        self.uri_opener = opener;
        self
    }

    /// Controller for the detected platform that never matches itself.
    pub fn for_current_platform(host_name: &str, poll_interval: Duration) -> Self {
        let platform = platform::detect();
        let matcher = HostMatcher::new(host_name, platform)
            .excluding_self(std::process::id(), platform::own_install_dir());
        Self::new(matcher, platform, poll_interval)
    }

    fn alive(&self, pids: &[u32]) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes();
        pids.iter()
            .copied()
            .filter(|pid| {
                system
                    .process(Pid::from_u32(*pid))
                    .map(|p| p.status() != ProcessStatus::Zombie)
                    .unwrap_or(false)
            })
            .collect()
    }

    fn signal_terminate(&self, pids: &[u32]) {
        let mut system = System::new();
        system.refresh_processes();
        for pid in pids {
            if let Some(process) = system.process(Pid::from_u32(*pid)) {
                match process.kill_with(Signal::Term) {
                    Some(true) => tracing::debug!(pid, "sent SIGTERM"),
                    Some(false) => tracing::debug!(pid, "SIGTERM not delivered"),
                    None => tracing::debug!(pid, "SIGTERM unsupported on this platform"),
                }
            }
        }
    }

    fn request_quit(&self, handle: &ProcessHandle) {
        match &self.graceful {
            GracefulStop::AppleScript { app } => {
                tracing::info!(app = %app, "asking host to quit via AppleScript");
                let script = format!("tell application \"{app}\" to quit");
                run_bounded(Command::new("osascript").args(["-e", &script]), Duration::from_secs(3));
            }
            GracefulStop::TaskKill { image } => {
                tracing::info!(image = %image, "asking host to quit via taskkill");
                let mut cmd = Command::new("taskkill");
                cmd.args(["/IM", image.as_str(), "/T"]);
                hide_console(&mut cmd);
                run_bounded(&mut cmd, Duration::from_secs(3));
            }
            GracefulStop::Terminate => {
                tracing::info!(pids = ?handle.pids, "sending SIGTERM to host");
                self.signal_terminate(&handle.pids);
            }
        }
    }

    fn wait_for_host(&self, timeout: Duration) -> Option<ProcessHandle> {
        let start = Instant::now();
        loop {
            if let Some(handle) = self.discover() {
                return Some(handle);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn launch_executable(&self, exe: &Path) -> std::io::Result<()> {
        let mut cmd = Command::new(exe);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        hide_console(&mut cmd);
        let mut child = cmd.spawn()?;

        // catch binaries that exit straight away (wrong arch, missing libs)
        thread::sleep(self.poll_interval.min(Duration::from_millis(200)));
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("{} exited immediately with {status}", exe.display()),
                ));
            }
        }
        Ok(())
    }

    fn launch_uri(&self, uri: &str) -> std::io::Result<()> {
        let mut cmd = match &self.uri_opener {
            Some(opener) => {
                let mut cmd = Command::new(opener);
                cmd.arg(uri);
                cmd
            }
            None => platform::uri_opener(uri, self.platform),
        };
        hide_console(&mut cmd);
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("uri handler exited with {status}"),
            ))
        }
    }
}

impl ProcessController for SystemController {
    fn discover(&self) -> Option<ProcessHandle> {
        let mut system = System::new();
        system.refresh_processes();

        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(_, p)| p.status() != ProcessStatus::Zombie)
            .filter(|(pid, p)| self.matcher.matches(pid.as_u32(), p.name(), p.exe()))
            .map(|(pid, _)| pid.as_u32())
            .collect();

        if pids.is_empty() {
            return None;
        }
        pids.sort_unstable();
        Some(ProcessHandle {
            name: self.matcher.name().to_string(),
            pids,
        })
    }

    fn stop(&self, handle: &ProcessHandle, timeout: Duration) -> Result<StopOutcome> {
        if self.alive(&handle.pids).is_empty() {
            return Ok(StopOutcome::GracefullyStopped);
        }

        self.request_quit(handle);

        let start = Instant::now();
        let mut terminated = matches!(self.graceful, GracefulStop::Terminate);
        loop {
            let remaining = self.alive(&handle.pids);
            if remaining.is_empty() {
                tracing::info!(elapsed = ?start.elapsed(), "host exited");
                return Ok(StopOutcome::GracefullyStopped);
            }

            // the app-level request may be ignored; follow up with SIGTERM halfway through
            if !terminated && start.elapsed() >= timeout / 2 {
                self.signal_terminate(&remaining);
                terminated = true;
            }

            if start.elapsed() >= timeout {
                tracing::warn!(pids = ?remaining, ?timeout, "host did not exit in time");
                return Ok(StopOutcome::StillRunning(ProcessHandle {
                    name: handle.name.clone(),
                    pids: remaining,
                }));
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn force_stop(&self, handle: &ProcessHandle) -> Result<()> {
        let mut system = System::new();
        system.refresh_processes();

        for pid in &handle.pids {
            let sys_pid = Pid::from_u32(*pid);
            let Some(process) = system.process(sys_pid) else {
                continue;
            };
            if process.kill() {
                tracing::info!(pid, "killed host process");
                continue;
            }

            // kill refused: fine if the process simply exited meanwhile
            if system.refresh_process(sys_pid) {
                return Err(Error::Kill {
                    pid: *pid,
                    reason: "operating system refused the kill request".into(),
                });
            }
        }
        Ok(())
    }

    fn start(&self, spec: &LaunchSpec) -> Result<Launch> {
        let executable = spec
            .executables
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .or_else(|| spec.path_command.as_deref().and_then(platform::which));

        let mut failures = Vec::new();

        if let Some(exe) = executable {
            tracing::info!(exe = %exe.display(), "launching host");
            match self.launch_executable(&exe) {
                Ok(()) => {
                    let handle = self.wait_for_host(spec.confirm_timeout);
                    if handle.is_none() {
                        tracing::warn!(timeout = ?spec.confirm_timeout, "host not visible yet after launch");
                    }
                    return Ok(Launch {
                        method: LaunchMethod::Executable(exe),
                        handle,
                    });
                }
                Err(e) => {
                    tracing::warn!(exe = %exe.display(), error = %e, "direct launch failed");
                    failures.push(format!("{}: {e}", exe.display()));
                }
            }
        } else {
            failures.push("no executable found at the expected install locations".to_string());
        }

        if let Some(uri) = &spec.uri {
            tracing::info!(uri = %uri, "launching host through uri handler");
            match self.launch_uri(uri) {
                Ok(()) => {
                    let handle = self.wait_for_host(spec.confirm_timeout);
                    return Ok(Launch {
                        method: LaunchMethod::Uri(uri.clone()),
                        handle,
                    });
                }
                Err(e) => failures.push(format!("{uri}: {e}")),
            }
        }

        Err(Error::Launch(failures.join("; ")))
    }
}

/// Run a helper command, killing it if it outlives `timeout`.
fn run_bounded(cmd: &mut Command, timeout: Duration) {
    let mut child = match cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped()).spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(error = %e, "could not run quit helper");
            return;
        }
    };

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    tracing::warn!(%status, "quit helper reported failure");
                }
                return;
            }
            Ok(None) if start.elapsed() > timeout => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(?timeout, "quit helper timed out");
                return;
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to wait for quit helper");
                return;
            }
        }
    }
}

#[cfg(windows)]
fn hide_console(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_cmd: &mut Command) {}
