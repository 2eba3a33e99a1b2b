//! Snapshot storage.
//!
//! Layout under the data root:
//! - index.json: ordered snapshot metadata
//! - snapshots/<id>/: one full copy of the host's state directory per snapshot
//! - snapshots/.staging-<id>, .trash-<id>: transient, swept on open
//! - orphans/: payloads moved aside by `repair`
//! - index.lock: held by every update, across processes
//!
//! Payloads are always written completely before the index mentions them,
//! and removed before the index forgets them.

pub mod identity;
pub mod index;
pub mod tree;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ListOrder;
use crate::error::{Error, Result};
use crate::lock::{self, LockGuard};
use identity::Identity;
use index::SnapshotIndex;

/// Overwritten on every startup.
pub const STARTUP_SLOT: &str = "startup-backup";
/// Overwritten right before each switch.
pub const PRE_SWITCH_SLOT: &str = "pre-switch-backup";

const PAYLOAD_DIR: &str = "snapshots";
const ORPHAN_DIR: &str = "orphans";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

pub fn is_reserved(id: &str) -> bool {
    id == STARTUP_SLOT || id == PRE_SWITCH_SLOT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub display_name: String,
    pub account_email: Option<String>,
    pub account_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the payload was last written; differs from `created_at` only for
    /// snapshots refreshed by `overwrite`.
    pub captured_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Relative to the data root.
    pub payload_dir: PathBuf,
}

impl Snapshot {
    pub fn is_reserved(&self) -> bool {
        is_reserved(&self.id)
    }
}

/// Index entries and payload directories that do not match up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// ids in the index whose payload directory is gone
    pub missing_payloads: Vec<String>,
    /// payload directory names with no index entry
    pub orphan_payloads: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_payloads.is_empty() && self.orphan_payloads.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_consistent() {
            return Ok(());
        }
        let mut parts = Vec::new();
        if !self.missing_payloads.is_empty() {
            parts.push(format!("no payload for {}", self.missing_payloads.join(", ")));
        }
        if !self.orphan_payloads.is_empty() {
            parts.push(format!("unindexed payloads {}", self.orphan_payloads.join(", ")));
        }
        Err(Error::IndexConsistency(parts.join("; ")))
    }
}

/// Durable bookkeeping for snapshots and the live state they are taken from.
///
/// The engine only talks to storage through this trait so the switch
/// sequence can be exercised against an in-memory fake.
pub trait SnapshotStore: Send + Sync {
    /// Whether the live state directory exists and is non-empty.
    fn active_state_present(&self) -> bool;

    /// Identity currently signed in to the live state.
    fn active_identity(&self) -> Identity;

    /// Copy the live state into a new snapshot.
    fn capture(&self, label: Option<&str>) -> Result<Snapshot>;

    /// Copy a snapshot's payload over the live state.
    fn restore(&self, id: &str) -> Result<()>;

    /// Snapshots in configured order. Reserved slots only when asked.
    fn list(&self, include_reserved: bool) -> Result<Vec<Snapshot>>;

    fn get(&self, id: &str) -> Result<Snapshot>;

    /// Remove payload, then index entry.
    fn delete(&self, id: &str) -> Result<()>;

    /// Mark a snapshot as the one now in use.
    fn touch(&self, id: &str) -> Result<Snapshot>;

    /// Replace an existing snapshot's payload with the live state, keeping its
    /// id. Reserved slots are created on first use.
    fn overwrite(&self, id: &str) -> Result<Snapshot>;

    fn check(&self) -> Result<ConsistencyReport>;

    /// Resolve a user-supplied reference: reserved name, 1-based list
    /// position, exact id, or unique id prefix of 4+ characters.
    fn resolve(&self, reference: &str) -> Result<Snapshot> {
        let reference = reference.trim();
        if is_reserved(reference) {
            return self.get(reference);
        }

        let listed = self.list(false)?;
        if let Ok(position) = reference.parse::<usize>() {
            if (1..=listed.len()).contains(&position) {
                return Ok(listed[position - 1].clone());
            }
        }

        if let Some(exact) = listed.iter().find(|s| s.id == reference) {
            return Ok(exact.clone());
        }

        if reference.len() >= 4 {
            let matches: Vec<_> = listed.iter().filter(|s| s.id.starts_with(reference)).collect();
            match matches.as_slice() {
                [only] => return Ok((*only).clone()),
                [] => {}
                many => {
                    return Err(Error::NotFound(format!(
                        "{reference} (ambiguous, matches {} snapshots)",
                        many.len()
                    )))
                }
            }
        }

        Err(Error::NotFound(reference.to_string()))
    }
}

/// Filesystem-backed store.
pub struct FsSnapshotStore {
    root: PathBuf,
    state_dir: PathBuf,
    order: ListOrder,
}

impl FsSnapshotStore {
    /// Open (creating if needed) the store at `root`, tracking `state_dir`.
    pub fn open(root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>, order: ListOrder) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(PAYLOAD_DIR))?;

        let store = FsSnapshotStore {
            root,
            state_dir: state_dir.into(),
            order,
        };
        {
            let _guard = store.lock_index()?;
            store.sweep_transient();
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn payload_path(&self, snapshot: &Snapshot) -> PathBuf {
        self.root.join(&snapshot.payload_dir)
    }

    /// Drop index entries without payloads and move unindexed payloads to
    /// `orphans/`. Returns what was found before repairing.
    pub fn repair(&self) -> Result<ConsistencyReport> {
        let _guard = self.lock_index()?;
        let report = self.scan()?;
        if report.is_consistent() {
            return Ok(report);
        }

        let mut index = SnapshotIndex::load(&self.root)?;
        for id in &report.missing_payloads {
            index.remove(id);
            tracing::warn!(id = %id, "dropped index entry without payload");
        }
        index.save(&self.root)?;

        let orphan_root = self.root.join(ORPHAN_DIR);
        fs::create_dir_all(&orphan_root)?;
        for name in &report.orphan_payloads {
            let from = self.payloads().join(name);
            let to = orphan_root.join(name);
            fs::rename(&from, &to)?;
            tracing::warn!(from = %from.display(), to = %to.display(), "moved unindexed payload aside");
        }

        Ok(report)
    }

    fn payloads(&self) -> PathBuf {
        self.root.join(PAYLOAD_DIR)
    }

    /// Exclusive for the whole data root, including other store instances.
    /// Not reentrant: never call while already holding it.
    fn lock_index(&self) -> Result<LockGuard> {
        lock::acquire(&self.root, lock::STORE_LOCK_FILE)
    }

    /// Caller holds the index lock, so anything transient is a leftover.
    fn sweep_transient(&self) {
        index::remove_stale_temp_files(&self.root);
        let Ok(entries) = fs::read_dir(self.payloads()) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                match tree::remove_tree(&entry.path()) {
                    Ok(()) => tracing::info!(path = %entry.path().display(), "removed leftover from interrupted operation"),
                    Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove leftover"),
                }
            }
        }
    }

    /// Copy the live state into a fresh staging directory.
    fn stage_capture(&self, id: &str) -> Result<(PathBuf, Identity)> {
        if !self.state_dir.is_dir() {
            return Err(Error::Capture {
                path: self.state_dir.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host state directory does not exist",
                ),
            });
        }

        let staging = self.payloads().join(format!("{STAGING_PREFIX}{id}"));
        tree::remove_tree(&staging)?;

        if let Err(source) = tree::copy_tree(&self.state_dir, &staging) {
            let _ = tree::remove_tree(&staging);
            return Err(Error::Capture {
                path: self.state_dir.clone(),
                source,
            });
        }

        let identity = identity::extract(&staging);
        if !identity.is_known() {
            tracing::warn!(path = %self.state_dir.display(), "no signed-in account found in host state");
        }
        Ok((staging, identity))
    }

    fn scan(&self) -> Result<ConsistencyReport> {
        let index = SnapshotIndex::load(&self.root)?;
        let mut report = ConsistencyReport::default();

        for snapshot in &index.snapshots {
            if !self.payload_path(snapshot).is_dir() {
                report.missing_payloads.push(snapshot.id.clone());
            }
        }

        for entry in fs::read_dir(self.payloads())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let indexed = index
                .snapshots
                .iter()
                .any(|s| s.payload_dir == Path::new(PAYLOAD_DIR).join(&name));
            if !indexed {
                report.orphan_payloads.push(name);
            }
        }
        report.orphan_payloads.sort();

        Ok(report)
    }
}

fn default_label(identity: &Identity, now: DateTime<Utc>) -> String {
    match &identity.email {
        Some(email) => email.clone(),
        None => format!("snapshot {}", now.format("%Y-%m-%d %H:%M")),
    }
}

fn reserved_label(id: &str) -> &'static str {
    match id {
        STARTUP_SLOT => "Startup backup",
        _ => "Pre-switch backup",
    }
}

fn sort_snapshots(snapshots: &mut [Snapshot], order: ListOrder) {
    match order {
        ListOrder::Created => snapshots.sort_by_key(|s| s.created_at),
        // most recently used first, never-used last
        ListOrder::LastUsed => snapshots.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at)),
        ListOrder::Name => snapshots.sort_by_key(|s| s.display_name.to_lowercase()),
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn active_state_present(&self) -> bool {
        tree::has_content(&self.state_dir)
    }

    fn active_identity(&self) -> Identity {
        identity::extract(&self.state_dir)
    }

    fn capture(&self, label: Option<&str>) -> Result<Snapshot> {
        let _guard = self.lock_index()?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (staging, identity) = self.stage_capture(&id)?;

        let payload_dir = Path::new(PAYLOAD_DIR).join(&id);
        let final_path = self.root.join(&payload_dir);
        if let Err(source) = fs::rename(&staging, &final_path) {
            let _ = tree::remove_tree(&staging);
            return Err(Error::Capture {
                path: self.state_dir.clone(),
                source,
            });
        }

        let now = Utc::now();
        let snapshot = Snapshot {
            id: id.clone(),
            display_name: label
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| default_label(&identity, now)),
            account_email: identity.email,
            account_id: identity.account_id,
            created_at: now,
            captured_at: now,
            last_used_at: None,
            payload_dir,
        };

        let mut index = SnapshotIndex::load(&self.root)?;
        index.upsert(snapshot.clone());
        if let Err(e) = index.save(&self.root) {
            // never leave a payload the index does not know about
            let _ = tree::remove_tree(&final_path);
            return Err(e);
        }

        tracing::info!(id = %snapshot.id, name = %snapshot.display_name, "captured snapshot");
        Ok(snapshot)
    }

    fn restore(&self, id: &str) -> Result<()> {
        let _guard = self.lock_index()?;
        let snapshot = self.get(id)?;
        let payload = self.payload_path(&snapshot);

        let mode = tree::replace_with_copy(&payload, &self.state_dir).map_err(|source| Error::Restore {
            id: id.to_string(),
            source,
        })?;

        tracing::info!(id, ?mode, "restored snapshot into host state");
        Ok(())
    }

    fn list(&self, include_reserved: bool) -> Result<Vec<Snapshot>> {
        let index = SnapshotIndex::load(&self.root)?;
        let mut snapshots: Vec<_> = index
            .snapshots
            .into_iter()
            .filter(|s| include_reserved || !s.is_reserved())
            .collect();
        sort_snapshots(&mut snapshots, self.order);
        Ok(snapshots)
    }

    fn get(&self, id: &str) -> Result<Snapshot> {
        SnapshotIndex::load(&self.root)?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock_index()?;
        let mut index = SnapshotIndex::load(&self.root)?;
        let snapshot = index
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let payload = self.payload_path(&snapshot);
        let trash = self.payloads().join(format!("{TRASH_PREFIX}{id}"));
        let deletion = |source| Error::Deletion {
            id: id.to_string(),
            source,
        };

        if payload.exists() {
            // rename first so a failed removal can be undone
            fs::rename(&payload, &trash).map_err(deletion)?;
            if let Err(source) = tree::remove_tree(&trash) {
                if let Err(e) = fs::rename(&trash, &payload) {
                    tracing::error!(id, error = %e, "failed to put payload back after failed delete");
                }
                return Err(deletion(source));
            }
        } else {
            tracing::warn!(id, path = %payload.display(), "payload already missing, dropping index entry");
        }

        index.remove(id);
        index.save(&self.root)?;
        tracing::info!(id, "deleted snapshot");
        Ok(())
    }

    fn touch(&self, id: &str) -> Result<Snapshot> {
        let _guard = self.lock_index()?;
        let mut index = SnapshotIndex::load(&self.root)?;
        let snapshot = index.get_mut(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        snapshot.last_used_at = Some(Utc::now());
        let updated = snapshot.clone();
        index.save(&self.root)?;
        Ok(updated)
    }

    fn overwrite(&self, id: &str) -> Result<Snapshot> {
        let _guard = self.lock_index()?;
        let existing = match self.get(id) {
            Ok(snapshot) => Some(snapshot),
            Err(Error::NotFound(_)) if is_reserved(id) => None,
            Err(e) => return Err(e),
        };

        let (staging, identity) = self.stage_capture(id)?;
        let payload_dir = Path::new(PAYLOAD_DIR).join(id);
        let final_path = self.root.join(&payload_dir);
        let trash = self.payloads().join(format!("{TRASH_PREFIX}{id}"));

        let swap = || -> std::io::Result<()> {
            tree::remove_tree(&trash)?;
            if final_path.exists() {
                fs::rename(&final_path, &trash)?;
            }
            if let Err(e) = fs::rename(&staging, &final_path) {
                let _ = fs::rename(&trash, &final_path);
                return Err(e);
            }
            Ok(())
        };
        if let Err(source) = swap() {
            let _ = tree::remove_tree(&staging);
            return Err(Error::Capture {
                path: self.state_dir.clone(),
                source,
            });
        }

        let now = Utc::now();
        let snapshot = match existing {
            Some(mut snapshot) => {
                snapshot.account_email = identity.email;
                snapshot.account_id = identity.account_id;
                snapshot.captured_at = now;
                snapshot.payload_dir = payload_dir;
                snapshot
            }
            None => Snapshot {
                id: id.to_string(),
                display_name: reserved_label(id).to_string(),
                account_email: identity.email,
                account_id: identity.account_id,
                created_at: now,
                captured_at: now,
                last_used_at: None,
                payload_dir,
            },
        };

        let mut index = SnapshotIndex::load(&self.root)?;
        index.upsert(snapshot.clone());
        index.save(&self.root)?;

        if let Err(e) = tree::remove_tree(&trash) {
            tracing::warn!(path = %trash.display(), error = %e, "failed to remove replaced payload");
        }

        tracing::info!(id, "refreshed snapshot from host state");
        Ok(snapshot)
    }

    fn check(&self) -> Result<ConsistencyReport> {
        let _guard = self.lock_index()?;
        self.scan()
    }
}
