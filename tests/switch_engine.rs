use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use walkdir::WalkDir;

use idswap::config::{ListOrder, Timeouts};
use idswap::engine::{CancelToken, EngineOptions, HostStop, SwitchEngine, SwitchState, SwitchStep};
use idswap::error::{Error, Result};
use idswap::process::{Launch, LaunchMethod, LaunchSpec, ProcessController, ProcessHandle, StopOutcome};
use idswap::store::identity::Identity;
use idswap::store::{ConsistencyReport, FsSnapshotStore, Snapshot, SnapshotStore, PRE_SWITCH_SLOT, STARTUP_SLOT};

type Log = Arc<Mutex<Vec<String>>>;

/// Stand-in for the host application.
#[derive(Default)]
struct FakeHost {
    running: Mutex<bool>,
    ignores_quit: bool,
    unkillable: bool,
    fail_launch: bool,
    cancel_on_start: Option<CancelToken>,
    gate: Option<(Mutex<Sender<()>>, Mutex<Receiver<()>>)>,
    discovered: AtomicUsize,
    log: Log,
}

impl FakeHost {
    fn running(log: &Log) -> Self {
        FakeHost {
            running: Mutex::new(true),
            log: log.clone(),
            ..Default::default()
        }
    }

    fn stopped(log: &Log) -> Self {
        FakeHost {
            log: log.clone(),
            ..Default::default()
        }
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(call.to_string());
    }

    fn handle() -> ProcessHandle {
        ProcessHandle {
            name: "Host".into(),
            pids: vec![4242],
        }
    }
}

impl ProcessController for FakeHost {
    fn discover(&self) -> Option<ProcessHandle> {
        self.discovered.fetch_add(1, Ordering::SeqCst);
        self.is_running().then(FakeHost::handle)
    }

    fn stop(&self, handle: &ProcessHandle, _timeout: Duration) -> Result<StopOutcome> {
        self.record("stop");
        if let Some((entered, release)) = &self.gate {
            entered.lock().unwrap().send(()).unwrap();
            release.lock().unwrap().recv().unwrap();
        }
        if self.ignores_quit {
            return Ok(StopOutcome::StillRunning(handle.clone()));
        }
        *self.running.lock().unwrap() = false;
        Ok(StopOutcome::GracefullyStopped)
    }

    fn force_stop(&self, _handle: &ProcessHandle) -> Result<()> {
        self.record("force_stop");
        if !self.unkillable {
            *self.running.lock().unwrap() = false;
        }
        Ok(())
    }

    fn start(&self, _spec: &LaunchSpec) -> Result<Launch> {
        self.record("start");
        if let Some(token) = &self.cancel_on_start {
            token.cancel();
        }
        if self.fail_launch {
            return Err(Error::Launch("no executable and no uri".into()));
        }
        *self.running.lock().unwrap() = true;
        Ok(Launch {
            method: LaunchMethod::Executable(PathBuf::from("/fake/host")),
            handle: Some(FakeHost::handle()),
        })
    }
}

/// Real store that records calls and can be told to fail restores.
struct RecordingStore {
    inner: FsSnapshotStore,
    fail_restore: bool,
    log: Log,
}

impl RecordingStore {
    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }
}

impl SnapshotStore for RecordingStore {
    fn active_state_present(&self) -> bool {
        self.inner.active_state_present()
    }

    fn active_identity(&self) -> Identity {
        self.inner.active_identity()
    }

    fn capture(&self, label: Option<&str>) -> Result<Snapshot> {
        self.record("capture".into());
        self.inner.capture(label)
    }

    fn restore(&self, id: &str) -> Result<()> {
        self.record(format!("restore {id}"));
        if self.fail_restore {
            return Err(Error::Restore {
                id: id.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.restore(id)
    }

    fn list(&self, include_reserved: bool) -> Result<Vec<Snapshot>> {
        self.inner.list(include_reserved)
    }

    fn get(&self, id: &str) -> Result<Snapshot> {
        self.inner.get(id)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.record(format!("delete {id}"));
        self.inner.delete(id)
    }

    fn touch(&self, id: &str) -> Result<Snapshot> {
        self.record(format!("touch {id}"));
        self.inner.touch(id)
    }

    fn overwrite(&self, id: &str) -> Result<Snapshot> {
        self.record(format!("overwrite {id}"));
        self.inner.overwrite(id)
    }

    fn check(&self) -> Result<ConsistencyReport> {
        self.inner.check()
    }
}

struct Env {
    tmp: TempDir,
    state: PathBuf,
    log: Log,
}

impl Env {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join("Host/User/globalStorage");
        Env {
            tmp,
            state,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn data(&self) -> PathBuf {
        self.tmp.path().join("data")
    }

    fn set_state(&self, contents: &[(&str, &str)]) {
        let _ = fs::remove_dir_all(&self.state);
        fs::create_dir_all(&self.state).unwrap();
        for (name, body) in contents {
            let path = self.state.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
    }

    fn store(&self, fail_restore: bool) -> RecordingStore {
        RecordingStore {
            inner: FsSnapshotStore::open(self.data(), &self.state, ListOrder::Created).unwrap(),
            fail_restore,
            log: self.log.clone(),
        }
    }

    fn options(&self) -> EngineOptions {
        EngineOptions {
            timeouts: Timeouts {
                graceful_stop: Duration::from_millis(100),
                force_stop: Duration::from_millis(100),
                launch_confirm: Duration::from_millis(10),
                poll_interval: Duration::from_millis(5),
            },
            launch: LaunchSpec {
                executables: vec![PathBuf::from("/fake/host")],
                path_command: None,
                uri: None,
                confirm_timeout: Duration::from_millis(10),
            },
            relaunch: true,
            lock_dir: Some(self.data()),
        }
    }

    fn engine(&self, host: FakeHost) -> SwitchEngine<RecordingStore, FakeHost> {
        SwitchEngine::new(self.store(false), host, self.options())
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

fn tree(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(dir)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// Two snapshots A and B, then unsaved live state that differs from both.
fn with_two_snapshots(env: &Env, engine: &SwitchEngine<RecordingStore, FakeHost>) -> (Snapshot, Snapshot) {
    env.set_state(&[("state.vscdb", "alpha")]);
    let a = engine.add_snapshot(Some("A")).unwrap();
    env.set_state(&[("state.vscdb", "beta"), ("nested/b.json", "{}")]);
    let b = engine.add_snapshot(Some("B")).unwrap();
    env.set_state(&[("state.vscdb", "alpha-unsaved"), ("draft.txt", "work in progress")]);
    env.log.lock().unwrap().clear();
    (a, b)
}

#[test]
fn switch_stops_backs_up_restores_and_relaunches() {
    let env = Env::new();
    let engine = env.engine(FakeHost::running(&env.log));
    let (_a, b) = with_two_snapshots(&env, &engine);
    let before = tree(&env.state);

    let report = engine.switch_to(&b.id).unwrap();

    assert_eq!(report.host_stop, HostStop::Graceful);
    assert_eq!(
        env.calls(),
        vec![
            "stop".to_string(),
            format!("overwrite {PRE_SWITCH_SLOT}"),
            format!("restore {}", b.id),
            "start".to_string(),
            format!("touch {}", b.id),
        ]
    );

    let store = engine.store();
    let backup = report.pre_switch_backup.unwrap();
    assert_eq!(tree(&store.inner.payload_path(&backup)), before);
    assert_eq!(tree(&env.state), tree(&store.inner.payload_path(&b)));
    assert!(store.get(&b.id).unwrap().last_used_at.is_some());
    assert!(engine.process().is_running());
    assert_eq!(engine.state(), SwitchState::Done);
}

#[test]
fn unknown_snapshot_fails_before_touching_the_host() {
    let env = Env::new();
    let engine = env.engine(FakeHost::running(&env.log));
    with_two_snapshots(&env, &engine);
    let before = tree(&env.state);

    let err = engine.switch_to("does-not-exist").unwrap_err();

    assert!(matches!(err.source, Error::NotFound(_)));
    assert_eq!(err.failed, None);
    assert!(env.calls().is_empty());
    assert!(engine.process().is_running());
    assert_eq!(tree(&env.state), before);
}

#[test]
fn ignored_quit_escalates_to_forced_stop() {
    let env = Env::new();
    let host = FakeHost {
        ignores_quit: true,
        ..FakeHost::running(&env.log)
    };
    let engine = env.engine(host);
    let (_a, b) = with_two_snapshots(&env, &engine);

    let report = engine.switch_to(&b.id).unwrap();

    assert_eq!(report.host_stop, HostStop::Forced);
    let calls = env.calls();
    assert_eq!(&calls[..2], ["stop", "force_stop"]);
    assert_eq!(calls.iter().filter(|c| *c == "stop").count(), 1);
    assert_eq!(tree(&env.state), tree(&engine.store().inner.payload_path(&b)));
}

#[test]
fn process_that_survives_kill_aborts_switch_before_backup() {
    let env = Env::new();
    let host = FakeHost {
        ignores_quit: true,
        unkillable: true,
        ..FakeHost::running(&env.log)
    };
    let engine = env.engine(host);
    let (_a, b) = with_two_snapshots(&env, &engine);
    let before = tree(&env.state);

    let err = engine.switch_to(&b.id).unwrap_err();

    assert!(matches!(err.source, Error::Stop { ref pids } if pids == &vec![4242]));
    assert_eq!(err.failed, Some(SwitchStep::StopHost));
    assert_eq!(err.last_completed, None);
    assert!(!err.backup_taken);
    assert_eq!(tree(&env.state), before);
    assert!(!env.calls().iter().any(|c| c.starts_with("overwrite") || c.starts_with("restore")));
    assert_eq!(engine.state(), SwitchState::Failed);
}

#[test]
fn host_not_running_skips_stop_but_still_relaunches() {
    let env = Env::new();
    let engine = env.engine(FakeHost::stopped(&env.log));
    let (a, _b) = with_two_snapshots(&env, &engine);

    let report = engine.switch_to(&a.id).unwrap();

    assert_eq!(report.host_stop, HostStop::NotRunning);
    assert!(!env.calls().contains(&"stop".to_string()));
    assert!(env.calls().contains(&"start".to_string()));
}

#[test]
fn missing_live_state_skips_pre_switch_backup() {
    let env = Env::new();
    let engine = env.engine(FakeHost::stopped(&env.log));
    let (a, _b) = with_two_snapshots(&env, &engine);
    fs::remove_dir_all(&env.state).unwrap();

    let report = engine.switch_to(&a.id).unwrap();

    assert!(report.pre_switch_backup.is_none());
    assert!(!env.calls().iter().any(|c| c.starts_with("overwrite")));
    assert_eq!(fs::read_to_string(env.state.join("state.vscdb")).unwrap(), "alpha");
}

#[test]
fn failed_restore_keeps_pre_switch_backup_and_skips_relaunch() {
    let env = Env::new();
    let store = env.store(true);
    let engine = SwitchEngine::new(store, FakeHost::running(&env.log), env.options());
    let (_a, b) = with_two_snapshots(&env, &engine);
    let before = tree(&env.state);

    let err = engine.switch_to(&b.id).unwrap_err();

    assert!(matches!(err.source, Error::Restore { .. }));
    assert_eq!(err.failed, Some(SwitchStep::Restore));
    assert_eq!(err.last_completed, Some(SwitchStep::BackupCurrent));
    assert!(err.backup_taken);
    assert!(err.to_string().contains(PRE_SWITCH_SLOT));

    let backup = engine.store().get(PRE_SWITCH_SLOT).unwrap();
    assert_eq!(tree(&engine.store().inner.payload_path(&backup)), before);
    assert!(!env.calls().contains(&"start".to_string()));
    assert!(engine.store().get(&b.id).unwrap().last_used_at.is_none());
}

#[test]
fn failed_relaunch_reports_restore_as_last_completed() {
    let env = Env::new();
    let host = FakeHost {
        fail_launch: true,
        ..FakeHost::running(&env.log)
    };
    let engine = env.engine(host);
    let (_a, b) = with_two_snapshots(&env, &engine);

    let err = engine.switch_to(&b.id).unwrap_err();

    assert!(matches!(err.source, Error::Launch(_)));
    assert_eq!(err.failed, Some(SwitchStep::Relaunch));
    assert_eq!(err.last_completed, Some(SwitchStep::Restore));
    assert_eq!(tree(&env.state), tree(&engine.store().inner.payload_path(&b)));
    assert!(engine.store().get(&b.id).unwrap().last_used_at.is_none());
}

#[test]
fn concurrent_switch_is_rejected_not_queued() {
    let env = Env::new();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let host = FakeHost {
        gate: Some((Mutex::new(entered_tx), Mutex::new(release_rx))),
        ..FakeHost::running(&env.log)
    };
    let engine = Arc::new(env.engine(host));
    let (a, b) = with_two_snapshots(&env, &engine);

    let first = {
        let engine = Arc::clone(&engine);
        let id = b.id.clone();
        thread::spawn(move || engine.switch_to(&id))
    };

    entered_rx.recv().unwrap();
    assert_eq!(engine.state(), SwitchState::StoppingHost);
    let second = engine.switch_to(&a.id).unwrap_err();
    assert!(matches!(second.source, Error::OperationInProgress));
    assert_eq!(second.failed, None);

    release_tx.send(()).unwrap();
    let report = first.join().unwrap().unwrap();
    assert_eq!(report.target.id, b.id);
    assert_eq!(env.calls().iter().filter(|c| c.starts_with("restore")).count(), 1);
}

#[test]
fn lock_held_by_another_process_is_reported_as_in_progress() {
    let env = Env::new();
    let engine = env.engine(FakeHost::running(&env.log));
    let (_a, b) = with_two_snapshots(&env, &engine);

    let _held = idswap::lock::try_acquire(&env.data()).unwrap();
    let err = engine.switch_to(&b.id).unwrap_err();

    assert!(matches!(err.source, Error::OperationInProgress));
    assert!(env.calls().is_empty());
}

#[test]
fn cancel_before_restore_leaves_host_stopped_and_state_intact() {
    let env = Env::new();
    let engine = env.engine(FakeHost::running(&env.log));
    let (_a, b) = with_two_snapshots(&env, &engine);
    let before = tree(&env.state);

    let token = CancelToken::new();
    token.cancel();
    let err = engine.switch_to_with(&b.id, &token).unwrap_err();

    assert!(matches!(err.source, Error::Cancelled));
    assert_eq!(err.last_completed, Some(SwitchStep::StopHost));
    assert_eq!(engine.state(), SwitchState::Cancelled);
    assert!(!engine.process().is_running());
    assert_eq!(tree(&env.state), before);
    assert!(!env.calls().contains(&"start".to_string()));
}

#[test]
fn cancel_after_restore_is_deferred() {
    let env = Env::new();
    let token = CancelToken::new();
    let host = FakeHost {
        cancel_on_start: Some(token.clone()),
        ..FakeHost::running(&env.log)
    };
    let engine = env.engine(host);
    let (_a, b) = with_two_snapshots(&env, &engine);

    let report = engine.switch_to_with(&b.id, &token).unwrap();

    assert!(report.cancel_deferred);
    assert_eq!(engine.state(), SwitchState::Done);
    assert!(engine.store().get(&b.id).unwrap().last_used_at.is_some());
}

#[test]
fn switching_to_the_pre_switch_slot_recovers_previous_state() {
    let env = Env::new();
    let engine = env.engine(FakeHost::running(&env.log));
    let (_a, b) = with_two_snapshots(&env, &engine);
    let before = tree(&env.state);

    engine.switch_to(&b.id).unwrap();
    env.log.lock().unwrap().clear();
    let report = engine.switch_to(PRE_SWITCH_SLOT).unwrap();

    assert!(report.pre_switch_backup.is_none());
    assert!(!env.calls().iter().any(|c| c.starts_with("overwrite")));
    assert_eq!(tree(&env.state), before);
}

#[test]
fn startup_backup_runs_once() {
    let env = Env::new();
    env.set_state(&[("state.vscdb", "first-launch")]);
    let engine = env.engine(FakeHost::stopped(&env.log));

    let slot = engine.startup_backup().unwrap().unwrap();
    assert_eq!(slot.id, STARTUP_SLOT);
    assert_eq!(tree(&engine.store().inner.payload_path(&slot)), tree(&env.state));

    env.set_state(&[("state.vscdb", "changed")]);
    assert!(engine.startup_backup().unwrap().is_none());
    let slot = engine.store().get(STARTUP_SLOT).unwrap();
    assert_eq!(
        fs::read_to_string(engine.store().inner.payload_path(&slot).join("state.vscdb")).unwrap(),
        "first-launch"
    );
    assert!(engine.list(false).unwrap().is_empty());
}

#[test]
fn startup_backup_refused_while_locked_can_run_later() {
    let env = Env::new();
    env.set_state(&[("state.vscdb", "first-launch")]);
    let engine = env.engine(FakeHost::stopped(&env.log));

    let held = idswap::lock::try_acquire(&env.data()).unwrap();
    assert!(matches!(engine.startup_backup(), Err(Error::OperationInProgress)));
    drop(held);

    let slot = engine.startup_backup().unwrap().unwrap();
    assert_eq!(slot.id, STARTUP_SLOT);
    assert!(engine.startup_backup().unwrap().is_none());
}

#[test]
fn add_checks_for_running_host_but_leaves_it_alone() {
    let env = Env::new();
    env.set_state(&[("state.vscdb", "live")]);
    let engine = env.engine(FakeHost::running(&env.log));

    let snapshot = engine.add_snapshot(Some("while running")).unwrap();

    assert_eq!(snapshot.display_name, "while running");
    assert!(engine.process().discovered.load(Ordering::SeqCst) >= 1);
    assert!(engine.process().is_running());
    assert!(!env.calls().iter().any(|c| c == "stop" || c == "force_stop"));
}

#[test]
fn startup_backup_without_state_is_skipped() {
    let env = Env::new();
    let engine = env.engine(FakeHost::stopped(&env.log));
    assert!(engine.startup_backup().unwrap().is_none());
    assert!(engine.list(true).unwrap().is_empty());
}

#[test]
fn delete_by_position_removes_entry() {
    let env = Env::new();
    let engine = env.engine(FakeHost::stopped(&env.log));
    let (a, b) = with_two_snapshots(&env, &engine);

    let deleted = engine.delete("1").unwrap();

    assert_eq!(deleted.id, a.id);
    let remaining: Vec<_> = engine.list(false).unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(remaining, vec![b.id]);
}

#[test]
fn status_reports_last_used_snapshot() {
    let env = Env::new();
    let engine = env.engine(FakeHost::running(&env.log));
    let (_a, b) = with_two_snapshots(&env, &engine);

    assert!(engine.status().unwrap().current.is_none());
    engine.switch_to(&b.id).unwrap();

    let status = engine.status().unwrap();
    assert_eq!(status.current.map(|s| s.id), Some(b.id));
    assert_eq!(status.host_pids, Some(vec![4242]));
}
