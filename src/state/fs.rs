//! Filesystem-backed task and claim store.
//!
//! Layout under the tasks directory:
//!
//! ```text
//! backlog/<id>.md
//! in_progress/<id>.md
//! in_progress/<id>.claim      JSON claim, created with O_EXCL
//! completed/<id>.md
//! blocked/<id>.md
//! blocked/<id>.reason
//! ```
//!
//! State transitions are a single `rename(2)`, so a record is always in
//! exactly one collection. Claim creation relies on exclusive create and
//! claim revocation on renaming the claim to a unique tombstone, so both
//! have exactly one winner among racing processes.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::{
    ensure_archivable, ArchiveSummary, Claim, ClaimStore, InvalidRecord, Listing, TaskRepository,
};
use crate::config::Config;
use crate::core::{parse_record, render_record, Task, TaskId, TaskStatus};
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

const RECORD_EXT: &str = "md";
const CLAIM_EXT: &str = "claim";
const REASON_EXT: &str = "reason";

#[derive(Debug, Clone)]
pub struct FsStore {
    tasks_dir: PathBuf,
    archive_dir: PathBuf,
}

#[derive(Serialize)]
struct ArchiveManifest<'a> {
    label: &'a str,
    archived_at: chrono::DateTime<Utc>,
    completed: &'a [TaskId],
    blocked: &'a [TaskId],
}

impl FsStore {
    /// Store rooted at a project's `.relay` directory.
    pub fn new(project_root: &Path) -> Self {
        Self::at(
            Config::tasks_dir(project_root),
            Config::archive_dir(project_root),
        )
    }

    pub fn at(tasks_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Create the four collection directories.
    pub fn init(&self) -> Result<()> {
        for status in TaskStatus::ALL {
            fs::create_dir_all(self.collection(status))?;
        }
        fs::create_dir_all(&self.archive_dir)?;
        Ok(())
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn collection(&self, status: TaskStatus) -> PathBuf {
        self.tasks_dir.join(status.as_str())
    }

    pub fn record_path(&self, status: TaskStatus, id: &TaskId) -> PathBuf {
        self.collection(status)
            .join(format!("{}.{}", id, RECORD_EXT))
    }

    pub fn claim_path(&self, id: &TaskId) -> PathBuf {
        self.collection(TaskStatus::InProgress)
            .join(format!("{}.{}", id, CLAIM_EXT))
    }

    fn reason_path(&self, id: &TaskId) -> PathBuf {
        self.collection(TaskStatus::Blocked)
            .join(format!("{}.{}", id, REASON_EXT))
    }

    fn read_reason(&self, id: &TaskId) -> Option<String> {
        fs::read_to_string(self.reason_path(id))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn read_claim(path: &Path) -> Result<Option<Claim>> {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Claim>(&text) {
                Ok(claim) => Ok(Some(claim)),
                Err(e) => {
                    // A claim is briefly empty between create and first write.
                    rlog_debug!("unreadable claim {}: {}", path.display(), e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn files_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ext) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, contents)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

fn archive_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "archive".to_string()
    } else {
        cleaned
    }
}

impl TaskRepository for FsStore {
    fn list(&self, status: TaskStatus) -> Result<Listing> {
        let mut listing = Listing::default();
        for path in Self::files_with_ext(&self.collection(status), RECORD_EXT)? {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                // moved by another process since read_dir
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match parse_record(&path, &text, status) {
                Ok(mut task) => {
                    if status == TaskStatus::Blocked {
                        task.blocked_reason = self.read_reason(&task.id);
                    }
                    listing.tasks.push(task);
                }
                Err(e) => {
                    rlog_warn!("invalid task record {}: {}", path.display(), e);
                    listing.invalid.push(InvalidRecord {
                        status,
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        listing.tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listing)
    }

    fn insert(&self, task: &Task) -> Result<()> {
        for status in TaskStatus::ALL {
            if self.record_path(status, &task.id).exists() {
                return Err(Error::Validation(format!(
                    "task {} already exists in {}",
                    task.id, status
                )));
            }
        }
        fs::create_dir_all(self.collection(TaskStatus::Backlog))?;
        let path = self.record_path(TaskStatus::Backlog, &task.id);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(render_record(task).as_bytes())?;
        rlog_debug!("inserted task {} into backlog", task.id);
        Ok(())
    }

    fn move_state(&self, id: &TaskId, from: TaskStatus, to: TaskStatus) -> Result<()> {
        if from == to {
            return Err(Error::Validation(format!(
                "task {} is already in {}",
                id, from
            )));
        }
        let src = self.record_path(from, id);
        let dst = self.record_path(to, id);
        if dst.exists() {
            return Err(Error::Validation(format!(
                "task {} already has a record in {}",
                id, to
            )));
        }
        fs::create_dir_all(self.collection(to))?;

        match fs::rename(&src, &dst) {
            Ok(()) => {
                rlog_debug!("moved {} {} -> {}", id, from, to);
                if from == TaskStatus::Blocked {
                    self.clear_reason(id)?;
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::ConcurrentTransition {
                task: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn record_reason(&self, id: &TaskId, reason: &str) -> Result<()> {
        fs::create_dir_all(self.collection(TaskStatus::Blocked))?;
        Self::write_atomic(&self.reason_path(id), reason.as_bytes())
    }

    fn clear_reason(&self, id: &TaskId) -> Result<()> {
        match fs::remove_file(self.reason_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn archive(&self, label: &str) -> Result<ArchiveSummary> {
        ensure_archivable(self)?;
        let label = archive_label(label);
        let now = Utc::now();
        let dir = self
            .archive_dir
            .join(format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), label));

        let mut summary = ArchiveSummary {
            location: Some(dir.clone()),
            ..Default::default()
        };

        for status in [TaskStatus::Completed, TaskStatus::Blocked] {
            let records = Self::files_with_ext(&self.collection(status), RECORD_EXT)?;
            if records.is_empty() {
                continue;
            }
            let target = dir.join(status.as_str());
            fs::create_dir_all(&target)?;

            for path in records {
                let Some(name) = path.file_name() else {
                    continue;
                };
                match fs::rename(&path, target.join(name)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
                let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| TaskId::new(s).ok())
                else {
                    continue;
                };
                if status == TaskStatus::Blocked {
                    let reason = self.reason_path(&id);
                    if reason.exists() {
                        fs::rename(&reason, target.join(format!("{}.{}", id, REASON_EXT)))?;
                    }
                    summary.blocked.push(id);
                } else {
                    summary.completed.push(id);
                }
            }
        }

        if summary.total() == 0 {
            summary.location = None;
            return Ok(summary);
        }

        let manifest = ArchiveManifest {
            label: &label,
            archived_at: now,
            completed: &summary.completed,
            blocked: &summary.blocked,
        };
        fs::write(
            dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        rlog!(
            "archived {} completed and {} blocked tasks into {}",
            summary.completed.len(),
            summary.blocked.len(),
            dir.display()
        );
        Ok(summary)
    }
}

impl ClaimStore for FsStore {
    fn try_acquire(&self, task: &TaskId, worker: &str) -> Result<Claim> {
        fs::create_dir_all(self.collection(TaskStatus::InProgress))?;
        let path = self.claim_path(task);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = Self::read_claim(&path)?
                    .map(|c| c.worker_id)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(Error::ClaimHeld {
                    task: task.to_string(),
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let claim = Claim::new(task.clone(), worker);
        file.write_all(serde_json::to_string(&claim)?.as_bytes())?;
        file.sync_all()?;
        Ok(claim)
    }

    fn heartbeat(&self, claim: &Claim) -> Result<Claim> {
        let lost = || Error::ClaimLost {
            task: claim.task_id.to_string(),
        };
        let path = self.claim_path(&claim.task_id);

        // Never create: a revoked claim must stay revoked. Holding the handle
        // pins the inode, so a claim re-created at the same path is not touched.
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(lost()),
            Err(e) => return Err(e.into()),
        };
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        match serde_json::from_str::<Claim>(&text) {
            Ok(current) if current.same_holder(claim) => {}
            _ => return Err(lost()),
        }

        let mut refreshed = claim.clone();
        refreshed.last_heartbeat = Utc::now();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&refreshed)?.as_bytes())?;
        Ok(refreshed)
    }

    fn release(&self, claim: &Claim) -> Result<()> {
        let path = self.claim_path(&claim.task_id);
        match Self::read_claim(&path)? {
            None => return Ok(()),
            Some(current) if !current.same_holder(claim) => {
                return Err(Error::ClaimLost {
                    task: claim.task_id.to_string(),
                })
            }
            Some(_) => {}
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn revoke(&self, claim: &Claim) -> Result<bool> {
        let path = self.claim_path(&claim.task_id);
        match Self::read_claim(&path)? {
            Some(current) if current.same_holder(claim) => {}
            _ => return Ok(false),
        }

        let tombstone = self.collection(TaskStatus::InProgress).join(format!(
            ".{}.revoked-{}",
            claim.task_id,
            Uuid::new_v4().simple()
        ));
        match fs::rename(&path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let taken = Self::read_claim(&tombstone)?;
        if taken.as_ref().is_some_and(|t| t.same_holder(claim)) {
            fs::remove_file(&tombstone)?;
            return Ok(true);
        }

        // Someone re-acquired between our read and the rename: put theirs back.
        rlog_warn!(
            "revoke of {} raced with a new claim, restoring it",
            claim.task_id
        );
        match fs::hard_link(&tombstone, &path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        fs::remove_file(&tombstone)?;
        Ok(false)
    }

    fn get(&self, task: &TaskId) -> Result<Option<Claim>> {
        Self::read_claim(&self.claim_path(task))
    }

    fn list_claims(&self) -> Result<Vec<Claim>> {
        let mut claims = Vec::new();
        for path in Self::files_with_ext(&self.collection(TaskStatus::InProgress), CLAIM_EXT)? {
            if let Some(claim) = Self::read_claim(&path)? {
                claims.push(claim);
            }
        }
        claims.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(claims)
    }
}
