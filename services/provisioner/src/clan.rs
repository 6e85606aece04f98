//! Snapshot lineages that carry persistent workspaces across VMs.
//!
//! When a node is torn down, each of its template's persistent paths is
//! snapshotted and recorded as a [`FileSystemLineage`]. The next VM of the
//! same template starts those paths from the snapshots, provided it landed
//! on the host that holds them.
//!
//! One clan file per template lives at `<data_dir>/templates/<id>/clan.json`.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mansion_id::TemplateId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::broker::{Broker, VmSpec, VmState};

/// A clan shared by every teardown and wipe of its template.
pub type SharedClan = Arc<tokio::sync::Mutex<FileSystemClan>>;

/// Clan file format version.
const CLAN_VERSION: u32 = 1;

/// Latest snapshot of one persistent path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemLineage {
    pub path: String,
    pub snapshot: Url,
}

impl FileSystemLineage {
    pub fn new(path: impl Into<String>, snapshot: Url) -> Self {
        Self {
            path: path.into(),
            snapshot,
        }
    }

    /// Host holding the snapshot.
    pub fn host(&self) -> Option<&str> {
        self.snapshot.host_str()
    }

    /// Whether `self` supersedes `other`: same path, same originating host.
    pub fn obsoletes(&self, other: &FileSystemLineage) -> bool {
        self.path == other.path && self.host() == other.host()
    }

    /// Overlay the snapshot onto `spec` if it lives on `vm_host`.
    pub fn apply_to(&self, spec: &mut VmSpec, vm_host: &str) -> bool {
        if self.host() != Some(vm_host) {
            return false;
        }
        spec.overlay_snapshot(&self.path, self.snapshot.clone());
        true
    }
}

/// On-disk clan record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClanRecord {
    pub version: u32,
    pub lineages: Vec<FileSystemLineage>,
    pub last_destroyed_at: Option<DateTime<Utc>>,
}

impl Default for ClanRecord {
    fn default() -> Self {
        Self {
            version: CLAN_VERSION,
            lineages: Vec::new(),
            last_destroyed_at: None,
        }
    }
}

/// The lineages of one template.
pub struct FileSystemClan {
    template: TemplateId,
    path: PathBuf,
    record: ClanRecord,
    broker: Arc<dyn Broker>,
}

impl FileSystemClan {
    pub fn template(&self) -> &TemplateId {
        &self.template
    }

    pub fn lineages(&self) -> &[FileSystemLineage] {
        &self.record.lineages
    }

    pub fn last_destroyed_at(&self) -> Option<DateTime<Utc>> {
        self.record.last_destroyed_at
    }

    /// Overlay every lineage stored on `vm_host` onto `spec`.
    ///
    /// Returns the number of lineages applied.
    pub fn apply_to(&self, spec: &mut VmSpec, vm_host: Option<&str>) -> usize {
        let Some(host) = vm_host else {
            return 0;
        };
        self.record
            .lineages
            .iter()
            .filter(|l| l.apply_to(spec, host))
            .count()
    }

    /// Insert `lineage`, disposing every lineage it supersedes.
    pub async fn add(&mut self, lineage: FileSystemLineage) {
        let (superseded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.record.lineages)
            .into_iter()
            .partition(|existing| lineage.obsoletes(existing));
        self.record.lineages = kept;

        for old in superseded {
            debug!(
                template = %self.template,
                path = %old.path,
                snapshot = %old.snapshot,
                "disposing superseded snapshot"
            );
            if let Err(e) = self.broker.dispose_snapshot(&old.snapshot).await {
                warn!(
                    template = %self.template,
                    snapshot = %old.snapshot,
                    error = %e,
                    "Failed to dispose superseded snapshot"
                );
            }
        }

        self.record.lineages.push(lineage);
    }

    /// Snapshot the persistent paths of a VM being torn down.
    ///
    /// Skipped when the clan was wiped after the VM was created. Persists
    /// the result; failures are logged.
    pub async fn update(
        &mut self,
        persistent_paths: &BTreeSet<String>,
        state: &VmState,
        vm_created_at: DateTime<Utc>,
    ) {
        if let Some(destroyed) = self.record.last_destroyed_at {
            if destroyed > vm_created_at {
                info!(
                    template = %self.template,
                    %destroyed,
                    %vm_created_at,
                    "Clan was disposed after this VM was created, not recording snapshots"
                );
                return;
            }
        }

        for path in persistent_paths {
            let Some(file_system) = state.file_systems.get(path) else {
                debug!(template = %self.template, path = %path, "VM reports no file system for path");
                continue;
            };
            match self.broker.snapshot(file_system).await {
                Ok(snapshot) => {
                    info!(template = %self.template, path = %path, %snapshot, "Recorded snapshot");
                    self.add(FileSystemLineage::new(path.clone(), snapshot)).await;
                }
                Err(e) => {
                    warn!(
                        template = %self.template,
                        file_system = %file_system,
                        error = %e,
                        "Failed to take snapshot"
                    );
                }
            }
        }

        if let Err(e) = self.save() {
            warn!(template = %self.template, error = %e, "Failed to persist the clan");
        }
    }

    /// Dispose every snapshot and forget them.
    ///
    /// Stamps the destroy time so that teardown of VMs created before now
    /// records nothing.
    pub async fn dispose_all(&mut self) -> Result<()> {
        for lineage in std::mem::take(&mut self.record.lineages) {
            if let Err(e) = self.broker.dispose_snapshot(&lineage.snapshot).await {
                warn!(
                    template = %self.template,
                    snapshot = %lineage.snapshot,
                    error = %e,
                    "Failed to dispose snapshot"
                );
            }
        }
        self.record.last_destroyed_at = Some(Utc::now());
        info!(template = %self.template, "Disposed clan");
        self.save()
    }

    /// Atomically write the clan file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create clan directory: {}", parent.display())
            })?;
        }

        let content =
            serde_json::to_string_pretty(&self.record).context("Failed to serialize clan")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &content)
            .with_context(|| format!("Failed to write temp clan file: {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename clan file: {}", self.path.display()))?;

        debug!(
            template = %self.template,
            path = %self.path.display(),
            lineages = self.record.lineages.len(),
            "Saved clan"
        );
        Ok(())
    }
}

/// Loads clans from the data directory.
///
/// Each template has one in-memory clan, read from disk on first use. Hold
/// its lock for the whole of an update or wipe, save included.
pub struct ClanStore {
    root: PathBuf,
    broker: Arc<dyn Broker>,
    clans: Mutex<HashMap<TemplateId, SharedClan>>,
}

impl ClanStore {
    pub fn new(data_dir: &Path, broker: Arc<dyn Broker>) -> Self {
        Self {
            root: data_dir.join("templates"),
            broker,
            clans: Mutex::new(HashMap::new()),
        }
    }

    /// The shared clan of `template`.
    pub fn clan(&self, template: &TemplateId) -> SharedClan {
        let mut clans = self.clans.lock().unwrap_or_else(PoisonError::into_inner);
        let clan = clans
            .entry(template.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(self.load(template))));
        Arc::clone(clan)
    }

    /// Clan file of `template`.
    pub fn path_for(&self, template: &TemplateId) -> PathBuf {
        self.root.join(template.as_str()).join("clan.json")
    }

    /// Read a clan file, failing on unreadable or corrupt files.
    ///
    /// Bypasses the shared clans; use [`ClanStore::clan`] to modify.
    pub fn try_load(&self, template: &TemplateId) -> Result<FileSystemClan> {
        let path = self.path_for(template);
        let record = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read clan file: {}", path.display()))?;
            let record: ClanRecord = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse clan file: {}", path.display()))?;
            if record.version != CLAN_VERSION {
                warn!(
                    file_version = record.version,
                    current_version = CLAN_VERSION,
                    path = %path.display(),
                    "Clan file version mismatch, starting fresh"
                );
                ClanRecord::default()
            } else {
                record
            }
        } else {
            ClanRecord::default()
        };

        Ok(FileSystemClan {
            template: template.clone(),
            path,
            record,
            broker: Arc::clone(&self.broker),
        })
    }

    /// Read a clan file; an unreadable file yields an empty clan.
    fn load(&self, template: &TemplateId) -> FileSystemClan {
        self.try_load(template).unwrap_or_else(|e| {
            warn!(template = %template, error = %e, "Failed to load clan, starting fresh");
            FileSystemClan {
                template: template.clone(),
                path: self.path_for(template),
                record: ClanRecord::default(),
                broker: Arc::clone(&self.broker),
            }
        })
    }
}
