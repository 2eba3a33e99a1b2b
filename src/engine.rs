//! Switch engine.
//!
//! The only code that writes the host's live state. A switch runs
//! stop host -> back up current state -> restore target -> relaunch -> mark used,
//! strictly in that order and under one lock. Failures stop the sequence where
//! they happen; nothing is rolled back, but the pre-switch backup written in the
//! second step is kept so the user can restore it.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Instant;

use serde::Serialize;

use crate::config::{Config, Timeouts};
use crate::error::{Error, Result};
use crate::lock::{self, LockGuard};
use crate::process::{Launch, LaunchSpec, ProcessController, ProcessHandle, StopOutcome};
use crate::store::identity::Identity;
use crate::store::{Snapshot, SnapshotStore, PRE_SWITCH_SLOT, STARTUP_SLOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchState {
    Idle,
    StoppingHost,
    BackingUpCurrent,
    Restoring,
    Relaunching,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchStep {
    StopHost,
    BackupCurrent,
    Restore,
    Relaunch,
    MarkUsed,
}

impl fmt::Display for SwitchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SwitchStep::StopHost => "stopping the host application",
            SwitchStep::BackupCurrent => "backing up the current state",
            SwitchStep::Restore => "restoring the snapshot",
            SwitchStep::Relaunch => "relaunching the host application",
            SwitchStep::MarkUsed => "marking the snapshot as used",
        };
        f.write_str(label)
    }
}

/// How the host went down before the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostStop {
    NotRunning,
    Graceful,
    Forced,
}

#[derive(Debug, Clone)]
pub struct SwitchReport {
    pub target: Snapshot,
    /// The refreshed pre-switch slot, if the live state was captured.
    pub pre_switch_backup: Option<Snapshot>,
    pub host_stop: HostStop,
    /// None when relaunch is disabled.
    pub launch: Option<Launch>,
    /// A cancel request arrived after restore had begun and was ignored.
    pub cancel_deferred: bool,
}

/// A failed switch, with enough context to tell the user what state they are in.
#[derive(Debug)]
pub struct SwitchError {
    pub reference: String,
    /// The step that failed; None if the switch never started.
    pub failed: Option<SwitchStep>,
    pub last_completed: Option<SwitchStep>,
    /// Whether the pre-switch backup slot holds the outgoing state.
    pub backup_taken: bool,
    pub source: Error,
}

impl SwitchError {
    fn before_start(reference: &str, source: Error) -> Self {
        SwitchError {
            reference: reference.to_string(),
            failed: None,
            last_completed: None,
            backup_taken: false,
            source,
        }
    }
}

impl fmt::Display for SwitchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failed {
            Some(step) => write!(f, "switch to {} failed while {step}: {}", self.reference, self.source)?,
            None => write!(f, "switch to {} not started: {}", self.reference, self.source)?,
        }
        if let Some(step) = self.last_completed {
            write!(f, " (last completed: {step})")?;
        }
        if self.backup_taken {
            write!(f, "; previous state saved as '{PRE_SWITCH_SLOT}'")?;
        }
        Ok(())
    }
}

impl std::error::Error for SwitchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<SwitchError> for Error {
    fn from(e: SwitchError) -> Self {
        e.source
    }
}

/// Shared flag for cancelling an in-flight switch from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub timeouts: Timeouts,
    pub launch: LaunchSpec,
    pub relaunch: bool,
    /// Directory for the cross-process lock file; None disables it.
    pub lock_dir: Option<PathBuf>,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        EngineOptions {
            timeouts: config.timeouts,
            launch: LaunchSpec {
                executables: config.host.executables.clone(),
                path_command: Some(config.host.name.to_lowercase()),
                uri: config.host.uri.clone(),
                confirm_timeout: config.timeouts.launch_confirm,
            },
            relaunch: config.relaunch,
            lock_dir: Some(config.data_dir.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub host_pids: Option<Vec<u32>>,
    pub identity: Identity,
    /// Most recently switched-to user snapshot.
    pub current: Option<Snapshot>,
}

pub struct SwitchEngine<S, P> {
    store: S,
    process: P,
    options: EngineOptions,
    busy: Mutex<()>,
    state: Mutex<SwitchState>,
    startup_done: AtomicBool,
}

/// Tracks progress through one switch so failures can report it.
struct Progress {
    last_completed: Option<SwitchStep>,
    backup_taken: bool,
}

impl<S: SnapshotStore, P: ProcessController> SwitchEngine<S, P> {
    pub fn new(store: S, process: P, options: EngineOptions) -> Self {
        SwitchEngine {
            store,
            process,
            options,
            busy: Mutex::new(()),
            state: Mutex::new(SwitchState::Idle),
            startup_done: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn state(&self) -> SwitchState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SwitchState) {
        tracing::debug!(?state, "switch state");
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Fails fast if a switch is running in this process or another one.
    fn try_begin(&self) -> Result<(MutexGuard<'_, ()>, Option<LockGuard>)> {
        let guard = match self.busy.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(Error::OperationInProgress),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        let file_lock = match &self.options.lock_dir {
            Some(dir) => {
                let file_lock = lock::try_acquire(dir)?;
                tracing::debug!(lock = %file_lock.path().display(), "took switch lock");
                Some(file_lock)
            }
            None => None,
        };
        Ok((guard, file_lock))
    }

    /// Waits for any running switch, then holds the lock.
    fn wait_idle(&self) -> MutexGuard<'_, ()> {
        self.busy.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn list(&self, include_reserved: bool) -> Result<Vec<Snapshot>> {
        self.store.list(include_reserved)
    }

    /// Explicit user backup of the live state.
    pub fn add_snapshot(&self, label: Option<&str>) -> Result<Snapshot> {
        let _guard = self.wait_idle();
        self.warn_if_host_running("capture");
        self.store.capture(label)
    }

    /// Captures taken while the host runs may catch it mid-write.
    fn warn_if_host_running(&self, what: &str) {
        if let Some(handle) = self.process.discover() {
            tracing::warn!(pids = ?handle.pids, "host is running; {what} may catch it mid-write");
        }
    }

    pub fn delete(&self, reference: &str) -> Result<Snapshot> {
        let _guard = self.wait_idle();
        let snapshot = self.store.resolve(reference)?;
        self.store.delete(&snapshot.id)?;
        Ok(snapshot)
    }

    /// Refresh the startup slot from the live state. Runs at most once per
    /// engine; later calls return `Ok(None)`. An attempt refused with
    /// `OperationInProgress` does not count.
    pub fn startup_backup(&self) -> Result<Option<Snapshot>> {
        if self.startup_done.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let (_guard, _file_lock) = self.try_begin()?;
        // checked again under the lock: another thread may have finished it
        if self.startup_done.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        match self.store.check() {
            Ok(report) if !report.is_consistent() => {
                tracing::warn!(
                    missing = ?report.missing_payloads,
                    orphans = ?report.orphan_payloads,
                    "snapshot index does not match payloads on disk"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "consistency scan failed"),
        }

        if !self.store.active_state_present() {
            tracing::info!("no host state yet, skipping startup backup");
            return Ok(None);
        }
        self.warn_if_host_running("startup backup");

        let snapshot = self.store.overwrite(STARTUP_SLOT)?;
        Ok(Some(snapshot))
    }

    pub fn status(&self) -> Result<Status> {
        let current = self
            .store
            .list(false)?
            .into_iter()
            .filter(|s| s.last_used_at.is_some())
            .max_by_key(|s| s.last_used_at);

        Ok(Status {
            host_pids: self.process.discover().map(|h| h.pids),
            identity: self.store.active_identity(),
            current,
        })
    }

    pub fn switch_to(&self, reference: &str) -> std::result::Result<SwitchReport, SwitchError> {
        self.switch_to_with(reference, &CancelToken::new())
    }

    pub fn switch_to_with(
        &self,
        reference: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<SwitchReport, SwitchError> {
        let (_guard, _file_lock) = self
            .try_begin()
            .map_err(|e| SwitchError::before_start(reference, e))?;

        let target = self
            .store
            .resolve(reference)
            .map_err(|e| SwitchError::before_start(reference, e))?;

        tracing::info!(id = %target.id, name = %target.display_name, "switching snapshot");
        let mut progress = Progress {
            last_completed: None,
            backup_taken: false,
        };

        match self.run_switch(&target, cancel, &mut progress) {
            Ok(report) => {
                self.set_state(SwitchState::Done);
                tracing::info!(id = %report.target.id, "switch complete");
                Ok(report)
            }
            Err((step, source)) => {
                if matches!(source, Error::Cancelled) {
                    self.set_state(SwitchState::Cancelled);
                    tracing::warn!(id = %target.id, "switch cancelled, host left stopped");
                } else {
                    self.set_state(SwitchState::Failed);
                    tracing::error!(id = %target.id, %step, error = %source, "switch failed");
                }
                Err(SwitchError {
                    reference: reference.to_string(),
                    failed: Some(step),
                    last_completed: progress.last_completed,
                    backup_taken: progress.backup_taken,
                    source,
                })
            }
        }
    }

    fn run_switch(
        &self,
        target: &Snapshot,
        cancel: &CancelToken,
        progress: &mut Progress,
    ) -> std::result::Result<SwitchReport, (SwitchStep, Error)> {
        self.set_state(SwitchState::StoppingHost);
        let host_stop = self.stop_host().map_err(|e| (SwitchStep::StopHost, e))?;
        progress.last_completed = Some(SwitchStep::StopHost);

        if cancel.is_cancelled() {
            return Err((SwitchStep::BackupCurrent, Error::Cancelled));
        }

        self.set_state(SwitchState::BackingUpCurrent);
        let pre_switch_backup = if target.is_reserved() {
            // restoring a safety slot is a recovery; do not clobber it first
            tracing::warn!(id = %target.id, "target is a backup slot, skipping pre-switch backup");
            None
        } else if !self.store.active_state_present() {
            tracing::info!("no host state to back up");
            None
        } else {
            let backup = self
                .store
                .overwrite(PRE_SWITCH_SLOT)
                .map_err(|e| (SwitchStep::BackupCurrent, e))?;
            progress.backup_taken = true;
            Some(backup)
        };
        progress.last_completed = Some(SwitchStep::BackupCurrent);

        if cancel.is_cancelled() {
            return Err((SwitchStep::Restore, Error::Cancelled));
        }

        // past this point cancellation is no longer honored
        self.set_state(SwitchState::Restoring);
        self.store
            .restore(&target.id)
            .map_err(|e| (SwitchStep::Restore, e))?;
        progress.last_completed = Some(SwitchStep::Restore);

        self.set_state(SwitchState::Relaunching);
        let launch = if self.options.relaunch {
            let launch = self
                .process
                .start(&self.options.launch)
                .map_err(|e| (SwitchStep::Relaunch, e))?;
            Some(launch)
        } else {
            None
        };
        progress.last_completed = Some(SwitchStep::Relaunch);

        let target = self
            .store
            .touch(&target.id)
            .map_err(|e| (SwitchStep::MarkUsed, e))?;
        progress.last_completed = Some(SwitchStep::MarkUsed);

        let cancel_deferred = cancel.is_cancelled();
        if cancel_deferred {
            tracing::info!("cancel requested after restore began; switch completed anyway");
        }

        Ok(SwitchReport {
            target,
            pre_switch_backup,
            host_stop,
            launch,
            cancel_deferred,
        })
    }

    /// Graceful stop, forced stop if needed, then confirm nothing matching is
    /// left. The confirmation is required: a quit request can be accepted
    /// without the process exiting.
    fn stop_host(&self) -> Result<HostStop> {
        let Some(handle) = self.process.discover() else {
            tracing::info!("host not running");
            return Ok(HostStop::NotRunning);
        };

        tracing::info!(pids = ?handle.pids, "stopping host");
        let mut how = match self.process.stop(&handle, self.options.timeouts.graceful_stop)? {
            StopOutcome::GracefullyStopped => HostStop::Graceful,
            StopOutcome::StillRunning(remaining) => {
                tracing::warn!(pids = ?remaining.pids, "escalating to forced stop");
                self.process.force_stop(&remaining)?;
                HostStop::Forced
            }
        };

        let deadline = Instant::now() + self.options.timeouts.force_stop;
        while let Some(survivor) = self.process.discover() {
            if Instant::now() >= deadline {
                return Err(Error::Stop { pids: survivor.pids });
            }
            self.kill_survivor(&survivor)?;
            how = HostStop::Forced;
            thread::sleep(self.options.timeouts.poll_interval);
        }

        Ok(how)
    }

    fn kill_survivor(&self, survivor: &ProcessHandle) -> Result<()> {
        tracing::warn!(pids = ?survivor.pids, "host still present after stop, killing");
        self.process.force_stop(survivor)
    }
}
