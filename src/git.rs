use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, ErrorCode, FileFavor, Index, IndexAddOption, MergeOptions, Oid,
    Repository, Signature, StatusOptions, WorktreeAddOptions, WorktreePruneOptions,
};

use crate::core::TaskId;
use crate::orchestration::{Integration, WorkspaceProvider};
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

/// One git worktree and branch per task, created from the baseline's HEAD.
pub struct GitWorkspaces {
    root: PathBuf,
    worktrees: PathBuf,
    branch_prefix: String,
}

impl GitWorkspaces {
    pub fn new(repo_path: &Path, worktrees: PathBuf, branch_prefix: &str) -> Result<Self> {
        rlog_debug!("GitWorkspaces::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .ok_or_else(|| Error::Validation("baseline repository is bare".to_string()))?
            .to_path_buf();
        Ok(Self {
            root,
            worktrees,
            branch_prefix: branch_prefix.to_string(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.root)?)
    }

    pub fn branch_name(&self, task: &TaskId) -> String {
        format!("{}{}", self.branch_prefix, task)
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("relay", "relay@localhost"))?)
    }

    fn baseline_head(&self) -> Result<Oid> {
        Ok(self.repo()?.head()?.peel_to_commit()?.id())
    }

    fn branch_commit<'r>(&self, repo: &'r Repository, task: &TaskId) -> Result<Commit<'r>> {
        let branch = self.branch_name(task);
        match repo.find_branch(&branch, BranchType::Local) {
            Ok(b) => Ok(b.get().peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::NotFound => Err(Error::TaskNotFound(format!(
                "no workspace branch {} for task {}",
                branch, task
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn prune_options() -> WorktreePruneOptions {
        let mut opts = WorktreePruneOptions::new();
        opts.valid(true).working_tree(true).locked(true);
        opts
    }

    fn conflict_paths(index: &Index) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let path = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).to_string())
                .unwrap_or_default();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl WorkspaceProvider for GitWorkspaces {
    fn baseline(&self) -> &Path {
        &self.root
    }

    fn path(&self, task: &TaskId) -> PathBuf {
        self.worktrees.join(task.as_str())
    }

    fn create(&self, task: &TaskId) -> Result<PathBuf> {
        let path = self.path(task);
        let branch = self.branch_name(task);
        let repo = self.repo()?;

        let leftover = path.exists()
            || repo.find_worktree(task.as_str()).is_ok()
            || repo.find_branch(&branch, BranchType::Local).is_ok();
        if leftover {
            rlog_debug!("replacing leftover workspace for {}", task);
            self.discard(task)?;
        }

        let head = repo.head()?.peel_to_commit()?;
        rlog_debug!("creating branch {} from {}", branch, head.id());
        let reference = repo.branch(&branch, &head, true)?.into_reference();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(task.as_str(), &path, Some(&opts))?;
        rlog_debug!("workspace for {} at {}", task, path.display());
        Ok(path)
    }

    fn commit(&self, task: &TaskId, message: &str) -> Result<bool> {
        let wt = Repository::open(self.path(task))?;

        let mut status = StatusOptions::new();
        status.include_untracked(true).recurse_untracked_dirs(true);
        if !wt.statuses(Some(&mut status))?.is_empty() {
            let mut index = wt.index()?;
            index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
            // picks up deletions, which add_all skips
            index.update_all(["."].iter(), None)?;
            index.write()?;
            let tree = wt.find_tree(index.write_tree()?)?;
            let sig = Self::signature(&wt)?;
            let parent = wt.head()?.peel_to_commit()?;
            let id = wt.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
            rlog_debug!("committed pending changes for {} as {}", task, id);
        }

        let head = wt.head()?.peel_to_commit()?.id();
        let base = self.baseline_head()?;
        if head == base {
            return Ok(false);
        }
        Ok(wt.merge_base(head, base)? != head)
    }

    fn check_baseline(&self) -> Result<()> {
        let repo = self.repo()?;
        let mut status = StatusOptions::new();
        status.include_untracked(false).include_ignored(false);
        let statuses = repo.statuses(Some(&mut status))?;
        if statuses.is_empty() {
            return Ok(());
        }
        let dirty: Vec<String> = statuses
            .iter()
            .filter_map(|s| s.path().map(String::from))
            .take(5)
            .collect();
        Err(Error::Validation(format!(
            "baseline {} has uncommitted changes ({})",
            self.root.display(),
            dirty.join(", ")
        )))
    }

    fn integrate(&self, task: &TaskId) -> Result<Integration> {
        let repo = self.repo()?;
        let ours = repo.head()?.peel_to_commit()?;
        let theirs = self.branch_commit(&repo, task)?;

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            rlog_debug!("{} already integrated", task);
            return Ok(Integration::UpToDate);
        }

        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            let mut head = repo.head()?;
            head.set_target(
                theirs.id(),
                &format!("relay: fast-forward to {}", self.branch_name(task)),
            )?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            rlog!("fast-forwarded baseline to {} ({})", task, theirs.id());
            return Ok(Integration::FastForward {
                commit: theirs.id().to_string(),
            });
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        let conflicts = if index.has_conflicts() {
            let paths = Self::conflict_paths(&index)?;
            let mut favor = MergeOptions::new();
            favor.file_favor(FileFavor::Theirs);
            index = repo.merge_commits(&ours, &theirs, Some(&favor))?;
            if index.has_conflicts() {
                let unresolved = Self::conflict_paths(&index)?;
                rlog_warn!(
                    "unresolvable conflicts integrating {}: {}",
                    task,
                    unresolved.join(", ")
                );
                return Ok(Integration::Conflicted { paths: unresolved });
            }
            rlog_warn!(
                "resolved conflicts in favor of {}: {}",
                task,
                paths.join(", ")
            );
            paths
        } else {
            Vec::new()
        };

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let sig = Self::signature(&repo)?;
        let message = format!("Merge {} ({})", self.branch_name(task), task);
        let commit = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&ours, &theirs])?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        rlog!("merged {} into baseline as {}", task, commit);

        Ok(Integration::Merged {
            commit: commit.to_string(),
            conflicts,
        })
    }

    fn discard(&self, task: &TaskId) -> Result<()> {
        let path = self.path(task);
        let repo = self.repo()?;

        if let Ok(worktree) = repo.find_worktree(task.as_str()) {
            let _ = worktree.unlock();
            if let Err(e) = worktree.prune(Some(&mut Self::prune_options())) {
                rlog_warn!("worktree prune failed for {}: {}", task, e);
            }
        }
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        // Git considers the branch checked out while the admin dir exists.
        let admin = repo.path().join("worktrees").join(task.as_str());
        if admin.exists() {
            let _ = std::fs::remove_dir_all(&admin);
        }

        let branch = self.branch_name(task);
        match repo.find_branch(&branch, BranchType::Local) {
            Ok(mut b) => {
                if let Err(e) = b.delete() {
                    rlog_warn!("failed to delete branch {}: {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        rlog_debug!("discarded workspace for {}", task);
        Ok(())
    }
}
