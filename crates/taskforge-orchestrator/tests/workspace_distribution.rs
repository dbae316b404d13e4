//! Workspace distribution through the orchestrator, backed by real git
//! worktrees in a scratch repository.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use git2::{BranchType, Repository, Signature};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use taskforge_core::{Priority, TaskforgeError};
use taskforge_orchestrator::*;

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

fn single_slot_config() -> TaskforgeConfig {
    let mut config = TaskforgeConfig::default();
    config.distributor.max_workspaces = 1;
    config.distributor.workspace_max_load = 1;
    config
}

#[tokio::test]
async fn test_worktree_backed_distribution() {
    let repo_dir = tempfile::tempdir().unwrap();
    let trees = tempfile::tempdir().unwrap();
    let repo = init_repo(repo_dir.path());

    let mut config = single_slot_config();
    config.distributor.repository = Some(repo_dir.path().to_path_buf());
    config.distributor.worktree_dir = Some(trees.path().to_path_buf());
    let orchestrator = Orchestrator::builder(config, Arc::new(WorkerRegistry::new()))
        .build()
        .await
        .unwrap();

    let first = orchestrator
        .distribute(DistributeRequest::new("frontend", "render the cart"))
        .await
        .unwrap();
    let second = orchestrator
        .distribute(DistributeRequest::new("frontend", "render the invoice"))
        .await
        .unwrap();

    let workspaces = orchestrator.workspaces().await;
    assert_eq!(workspaces.len(), 1);
    let workspace = &workspaces[0];
    let path = workspace.path.clone().expect("worktree path");
    assert!(path.exists());
    assert!(repo.find_worktree(&workspace.id).is_ok());
    assert!(repo.find_branch(&workspace.branch, BranchType::Local).is_ok());

    let task = orchestrator.workspace_task(&first).await.unwrap();
    assert_eq!(task.status, WorkspaceTaskStatus::Assigned);
    assert_eq!(task.workspace_id.as_deref(), Some(workspace.id.as_str()));
    assert!(task.branch.unwrap().starts_with("taskforge/frontend/"));
    assert_eq!(
        orchestrator.workspace_task(&second).await.unwrap().status,
        WorkspaceTaskStatus::Queued
    );

    orchestrator
        .complete_workspace_task(&first, Ok(serde_json::json!({"files": 3})))
        .await
        .unwrap();
    assert_eq!(
        orchestrator.workspace_task(&second).await.unwrap().status,
        WorkspaceTaskStatus::Assigned
    );
    orchestrator
        .complete_workspace_task(&second, Ok(serde_json::Value::Null))
        .await
        .unwrap();
    let done = orchestrator
        .distributor()
        .wait_for(&second, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(done.status, WorkspaceTaskStatus::Completed);

    let stats = orchestrator.statistics().await;
    assert_eq!(stats.workspaces.completed, 2);
    assert_eq!(stats.workspaces.total_load, 0);

    let later = chrono::Utc::now() + chrono::Duration::hours(2);
    let reclaimed = orchestrator.distributor().reclaim_idle_at(later).await;
    assert_eq!(reclaimed, vec![workspace.id.clone()]);
    assert!(repo.find_worktree(&workspace.id).is_err());
    assert!(repo.find_branch(&workspace.branch, BranchType::Local).is_err());
    assert!(orchestrator.workspaces().await.is_empty());
}

#[tokio::test]
async fn test_priority_and_dependencies_across_workspaces() {
    let orchestrator = Orchestrator::builder(single_slot_config(), Arc::new(WorkerRegistry::new()))
        .build()
        .await
        .unwrap();

    let holder = orchestrator
        .distribute(DistributeRequest::new("backend", "migrate schema"))
        .await
        .unwrap();
    let low = orchestrator
        .distribute(DistributeRequest::new("backend", "tidy logs").with_priority(Priority::Low))
        .await
        .unwrap();
    let dependent = orchestrator
        .distribute(
            DistributeRequest::new("backend", "backfill rows")
                .with_priority(Priority::Critical)
                .depends_on(vec![holder]),
        )
        .await
        .unwrap();
    assert_eq!(
        orchestrator.workspace_task(&dependent).await.unwrap().status,
        WorkspaceTaskStatus::Pending
    );

    // The released critical task overtakes the low priority one for the freed slot.
    orchestrator
        .complete_workspace_task(&holder, Ok(serde_json::Value::Null))
        .await
        .unwrap();
    assert_eq!(
        orchestrator.workspace_task(&dependent).await.unwrap().status,
        WorkspaceTaskStatus::Assigned
    );
    assert_eq!(
        orchestrator.workspace_task(&low).await.unwrap().status,
        WorkspaceTaskStatus::Queued
    );

    let workspace = orchestrator.workspaces().await.remove(0);
    assert_eq!(workspace.completed, 1);
    assert!(workspace.affinity["backend"] > 0.5);
}

#[tokio::test]
async fn test_failed_dependency_rejects_new_dependents() {
    let orchestrator = Orchestrator::builder(single_slot_config(), Arc::new(WorkerRegistry::new()))
        .build()
        .await
        .unwrap();
    let root = orchestrator
        .distribute(DistributeRequest::new("infra", "provision bucket"))
        .await
        .unwrap();
    orchestrator
        .complete_workspace_task(&root, Err("quota exceeded".into()))
        .await
        .unwrap();

    let err = orchestrator
        .distribute(DistributeRequest::new("infra", "upload assets").depends_on(vec![root]))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskforgeError::Dependency(_)));
    assert_eq!(orchestrator.workspaces().await[0].failed, 1);
}
