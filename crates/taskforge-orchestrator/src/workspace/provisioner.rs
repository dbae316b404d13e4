use async_trait::async_trait;
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use taskforge_core::{TaskforgeError, TaskforgeResult};
use tracing::info;

/// Creates and tears down the isolated context behind a workspace.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Create the workspace on `branch`. Returns its filesystem path, if it has one.
    async fn provision(&self, workspace_id: &str, branch: &str) -> TaskforgeResult<Option<PathBuf>>;

    /// Remove the workspace and its branch.
    async fn reclaim(&self, workspace_id: &str, branch: &str) -> TaskforgeResult<()>;
}

/// Workspaces without filesystem effects; tracks live ids only.
#[derive(Default)]
pub struct InMemoryProvisioner {
    live: Mutex<BTreeSet<String>>,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> Vec<String> {
        self.live.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl WorkspaceProvisioner for InMemoryProvisioner {
    async fn provision(&self, workspace_id: &str, _branch: &str) -> TaskforgeResult<Option<PathBuf>> {
        self.live.lock().insert(workspace_id.to_string());
        Ok(None)
    }

    async fn reclaim(&self, workspace_id: &str, _branch: &str) -> TaskforgeResult<()> {
        self.live.lock().remove(workspace_id);
        Ok(())
    }
}

/// One git worktree plus branch per workspace, created from the repository HEAD.
pub struct GitWorktreeProvisioner {
    repository: PathBuf,
    worktree_dir: PathBuf,
}

impl GitWorktreeProvisioner {
    pub fn new(repository: impl Into<PathBuf>, worktree_dir: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            worktree_dir: worktree_dir.into(),
        }
    }

    /// Worktrees under `<repository>/.worktrees`.
    pub fn in_repository(repository: impl Into<PathBuf>) -> Self {
        let repository = repository.into();
        let worktree_dir = repository.join(".worktrees");
        Self::new(repository, worktree_dir)
    }

    pub fn worktree_dir(&self) -> &Path {
        &self.worktree_dir
    }
}

fn git_err(e: git2::Error) -> TaskforgeError {
    TaskforgeError::Workspace(format!("git: {}", e.message()))
}

fn add_worktree(
    repository: &Path,
    worktree_dir: &Path,
    workspace_id: &str,
    branch_name: &str,
) -> TaskforgeResult<PathBuf> {
    let repo = Repository::open(repository).map_err(git_err)?;
    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(git_err)?;
    let branch = match repo.find_branch(branch_name, BranchType::Local) {
        Ok(existing) => existing,
        Err(_) => repo.branch(branch_name, &head, false).map_err(git_err)?,
    };

    std::fs::create_dir_all(worktree_dir)?;
    let path = worktree_dir.join(workspace_id);
    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(branch.get()));
    repo.worktree(workspace_id, &path, Some(&opts))
        .map_err(git_err)?;
    Ok(path)
}

fn remove_worktree(repository: &Path, workspace_id: &str, branch_name: &str) -> TaskforgeResult<()> {
    let repo = Repository::open(repository).map_err(git_err)?;
    if let Ok(worktree) = repo.find_worktree(workspace_id) {
        let mut opts = WorktreePruneOptions::new();
        opts.valid(true).working_tree(true);
        worktree.prune(Some(&mut opts)).map_err(git_err)?;
    }
    if let Ok(mut branch) = repo.find_branch(branch_name, BranchType::Local) {
        branch.delete().map_err(git_err)?;
    }
    Ok(())
}

#[async_trait]
impl WorkspaceProvisioner for GitWorktreeProvisioner {
    async fn provision(&self, workspace_id: &str, branch: &str) -> TaskforgeResult<Option<PathBuf>> {
        let repository = self.repository.clone();
        let worktree_dir = self.worktree_dir.clone();
        let id = workspace_id.to_string();
        let branch_name = branch.to_string();
        let path = tokio::task::spawn_blocking(move || {
            add_worktree(&repository, &worktree_dir, &id, &branch_name)
        })
        .await
        .map_err(|e| TaskforgeError::Workspace(format!("worktree task failed: {e}")))??;
        info!(workspace = %workspace_id, branch = %branch, path = %path.display(), "Added git worktree");
        Ok(Some(path))
    }

    async fn reclaim(&self, workspace_id: &str, branch: &str) -> TaskforgeResult<()> {
        let repository = self.repository.clone();
        let id = workspace_id.to_string();
        let branch_name = branch.to_string();
        tokio::task::spawn_blocking(move || remove_worktree(&repository, &id, &branch_name))
            .await
            .map_err(|e| TaskforgeError::Workspace(format!("worktree task failed: {e}")))??;
        info!(workspace = %workspace_id, branch = %branch, "Pruned git worktree");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use git2::Signature;

    fn init_repo(path: &Path) -> Repository {
        let repo = Repository::init(path).unwrap();
        {
            let sig = Signature::now("taskforge", "taskforge@localhost").unwrap();
            let tree_id = repo.index().unwrap().write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_in_memory_tracks_live() {
        let provisioner = InMemoryProvisioner::new();
        assert!(provisioner.provision("ws-1", "b").await.unwrap().is_none());
        assert_eq!(provisioner.live(), vec!["ws-1"]);
        provisioner.reclaim("ws-1", "b").await.unwrap();
        assert!(provisioner.live().is_empty());
    }

    #[tokio::test]
    async fn test_git_worktree_lifecycle() {
        let repo_dir = tempfile::tempdir().unwrap();
        let trees = tempfile::tempdir().unwrap();
        let repo = init_repo(repo_dir.path());
        let provisioner = GitWorktreeProvisioner::new(repo_dir.path(), trees.path());

        let path = provisioner
            .provision("ws-001", "taskforge/workspace/ws-001")
            .await
            .unwrap()
            .unwrap();
        assert!(path.exists());
        assert!(repo.find_worktree("ws-001").is_ok());
        assert!(repo
            .find_branch("taskforge/workspace/ws-001", BranchType::Local)
            .is_ok());

        provisioner
            .reclaim("ws-001", "taskforge/workspace/ws-001")
            .await
            .unwrap();
        assert!(repo
            .find_branch("taskforge/workspace/ws-001", BranchType::Local)
            .is_err());
    }

    #[tokio::test]
    async fn test_git_requires_repository() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = GitWorktreeProvisioner::in_repository(dir.path().join("missing"));
        let err = provisioner.provision("ws-1", "b").await.unwrap_err();
        assert!(matches!(err, TaskforgeError::Workspace(_)));
    }
}
