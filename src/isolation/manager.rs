// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Isolation environment lifecycle.
//!
//! The manager upholds one invariant: every logical workflow maps to at most
//! one active working directory. Environments are addressed two ways - by
//! workflow identity (`workflow_type`, `workflow_id`) when finding or
//! creating, and by uuid when a conversation points at one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::IsolationError;
use crate::gitio;
use crate::store::{Codebase, IsolationEnvironment, NewEnvironment, Store};
use crate::types::{EnvironmentStatus, WorkflowType};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::worktree::WorktreeOps;

/// Allowed shape of user-provided branch names.
static BRANCH_NAME: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9_-]+$").unwrap());

/// Validate a user-provided branch name.
pub(crate) fn valid_branch_name(name: &str) -> bool {
    BRANCH_NAME.is_match(name)
}

/// Request to find or create the environment of a workflow.
#[derive(Debug, Clone)]
pub struct EnsureRequest {
    pub workflow_type: WorkflowType,
    pub workflow_id: String,
    /// Issue numbers a PR is linked to; enables worktree sharing between an
    /// issue and its PR.
    pub related_issues: Vec<u64>,
    pub created_by_platform: String,
    /// Existing branch to check out instead of creating one (same-repo PR).
    pub branch_hint: Option<String>,
    /// Commit to start from when the hinted branch is not local.
    pub base_sha: Option<String>,
}

impl EnsureRequest {
    pub fn task(branch: &str, platform: &str) -> Self {
        Self {
            workflow_type: WorkflowType::Task,
            workflow_id: format!("task-{}", branch),
            related_issues: Vec::new(),
            created_by_platform: platform.to_string(),
            branch_hint: None,
            base_sha: None,
        }
    }
}

/// Result of an ensure call.
#[derive(Debug)]
pub struct EnsureOutcome {
    pub env: IsolationEnvironment,
    /// Set when an issue's worktree was reused for a PR; carries the issue
    /// number for the "Reusing worktree from issue #N" context line.
    pub reused_from_issue: Option<u64>,
    /// Whether a fresh worktree was created (false on lookup hits).
    pub created: bool,
}

/// Options for destroying an environment.
#[derive(Debug, Default)]
pub struct DestroyOptions {
    /// Discard uncommitted changes instead of refusing.
    pub force: bool,
    /// Branch to delete from the canonical clone after removal.
    pub branch_name: Option<String>,
    /// Canonical clone path; derived from the working path when absent.
    pub canonical_repo_path: Option<PathBuf>,
}

/// Create, find, share, and destroy worktree environments.
pub struct IsolationManager {
    store: Arc<Store>,
    settings: Settings,
}

impl IsolationManager {
    pub fn new(store: Arc<Store>, settings: Settings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Find or create the environment for a workflow identity.
    pub async fn ensure_for_workflow(
        &self,
        codebase: &Codebase,
        canonical_repo_path: &Path,
        request: EnsureRequest,
    ) -> Result<EnsureOutcome, IsolationError> {
        let ops = WorktreeOps::new(canonical_repo_path);

        // Identity lookup first.
        if let Some(env) = self
            .store
            .find_environment_by_workflow(&codebase.id, request.workflow_type, &request.workflow_id)
            .await?
        {
            if ops.is_valid_worktree(Path::new(&env.working_path)).await {
                return Ok(EnsureOutcome {
                    env,
                    reused_from_issue: None,
                    created: false,
                });
            }
            // The directory vanished out from under us; retire the row and
            // fall through to a fresh create.
            warn!(
                "environment {} path {} is gone, recreating",
                env.id, env.working_path
            );
            self.store
                .set_environment_status(&env.id, EnvironmentStatus::Destroyed)
                .await?;
        }

        // A PR linked to an issue shares the issue's worktree so the branch
        // carries over.
        if request.workflow_type == WorkflowType::Pr && !request.related_issues.is_empty() {
            let active = self
                .store
                .list_active_environments(Some(&codebase.id))
                .await?;
            for env in active {
                let shared = env
                    .related_issues()
                    .into_iter()
                    .find(|n| request.related_issues.contains(n));
                if let Some(issue) = shared {
                    if ops.is_valid_worktree(Path::new(&env.working_path)).await {
                        self.store
                            .merge_environment_metadata(
                                &env.id,
                                &json!({ "pr_number": request.workflow_id }),
                            )
                            .await?;
                        info!(
                            "reusing worktree of issue #{} for PR {}",
                            issue, request.workflow_id
                        );
                        let env = self
                            .store
                            .get_environment(&env.id)
                            .await?
                            .ok_or_else(|| IsolationError::EnvironmentNotFound(env.id.clone()))?;
                        return Ok(EnsureOutcome {
                            env,
                            reused_from_issue: Some(issue),
                            created: false,
                        });
                    }
                }
            }
        }

        self.enforce_limit(codebase, canonical_repo_path).await?;

        let branch = request
            .branch_hint
            .clone()
            .unwrap_or_else(|| request.workflow_type.branch_name(&request.workflow_id));

        let base = gitio::main_branch(canonical_repo_path).await;
        let path = match &request.branch_hint {
            Some(hint) => {
                ops.add_existing_branch(hint, request.base_sha.as_deref())
                    .await?
            }
            None => ops.add_new_branch(&branch, &base).await?,
        };

        if let Err(e) = gitio::add_safe_directory(&path).await {
            warn!("failed to trust {}: {}", path.display(), e);
        }

        let mut metadata = json!({});
        if !request.related_issues.is_empty() {
            metadata["related_issues"] = json!(request.related_issues);
        }
        if request.workflow_type == WorkflowType::Pr {
            metadata["pr_number"] = json!(request.workflow_id);
        }

        let env = self
            .store
            .insert_environment(NewEnvironment {
                codebase_id: codebase.id.clone(),
                workflow_type: request.workflow_type,
                workflow_id: request.workflow_id,
                working_path: path.to_string_lossy().to_string(),
                branch_name: branch,
                created_by_platform: request.created_by_platform,
                metadata,
            })
            .await?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_worktree_created();

        Ok(EnsureOutcome {
            env,
            reused_from_issue: None,
            created: true,
        })
    }

    /// Destroy an environment.
    ///
    /// Never discards uncommitted changes unless `force` is set or the
    /// directory is already gone. Callers clear `isolation_env_id` on
    /// conversations that pointed here.
    pub async fn destroy(
        &self,
        env: &IsolationEnvironment,
        opts: DestroyOptions,
    ) -> Result<(), IsolationError> {
        let path = Path::new(&env.working_path);
        let canonical = opts
            .canonical_repo_path
            .clone()
            .or_else(|| canonical_from_working_path(path))
            .unwrap_or_else(|| PathBuf::from("."));
        let ops = WorktreeOps::new(&canonical);

        if !path.exists() {
            // Nothing on disk to lose; still clean up the branch and row.
            // Prune first so git stops considering the branch checked out.
            let _ = ops.prune().await;
            if let Some(branch) = &opts.branch_name {
                let _ = gitio::delete_branch(&canonical, branch).await;
            }
            self.store
                .set_environment_status(&env.id, EnvironmentStatus::Destroyed)
                .await?;
            return Ok(());
        }

        if !opts.force && gitio::has_uncommitted_changes(path).await? {
            return Err(IsolationError::UncommittedChanges(
                env.working_path.clone(),
            ));
        }

        ops.remove(path, opts.force).await?;

        if let Some(branch) = &opts.branch_name {
            if let Err(e) = gitio::delete_branch(&canonical, branch).await {
                warn!("failed to delete branch {}: {}", branch, e);
            }
        }

        self.store
            .set_environment_status(&env.id, EnvironmentStatus::Destroyed)
            .await?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_worktree_destroyed();

        info!("destroyed environment {} ({})", env.id, env.branch_name);
        Ok(())
    }

    /// Enforce the per-codebase cap on active environments.
    ///
    /// On breach, runs merged-branch cleanup once and re-checks; a second
    /// breach fails with a per-branch breakdown for the user.
    async fn enforce_limit(
        &self,
        codebase: &Codebase,
        canonical_repo_path: &Path,
    ) -> Result<(), IsolationError> {
        let limit = self.settings.max_worktrees_per_codebase;
        let count = self.store.count_active_environments(&codebase.id).await?;
        if count < limit {
            return Ok(());
        }

        info!(
            "codebase {} at worktree limit ({}/{}), attempting merged cleanup",
            codebase.name, count, limit
        );
        let report =
            crate::cleanup::cleanup_merged_for_codebase(&self.store, self, codebase).await;
        info!(
            "cleanup removed {} environments for {}",
            report.removed.len(),
            codebase.name
        );

        let count = self.store.count_active_environments(&codebase.id).await?;
        if count < limit {
            return Ok(());
        }

        let breakdown = self
            .limit_breakdown(codebase, canonical_repo_path, count, limit)
            .await?;
        Err(IsolationError::LimitReached { breakdown })
    }

    async fn limit_breakdown(
        &self,
        codebase: &Codebase,
        canonical_repo_path: &Path,
        count: usize,
        limit: usize,
    ) -> Result<String, IsolationError> {
        let envs = self
            .store
            .list_active_environments(Some(&codebase.id))
            .await?;
        let main = gitio::main_branch(canonical_repo_path).await;
        let merged = gitio::merged_branches(canonical_repo_path, &main)
            .await
            .unwrap_or_default();
        let stale_ids: Vec<String> = self
            .store
            .find_stale_environments(self.settings.stale_threshold_days)
            .await?
            .into_iter()
            .filter(|e| e.codebase_id == codebase.id)
            .map(|e| e.id)
            .collect();

        let mut lines = vec![format!(
            "{} active worktrees (limit {}); {} merged, {} stale",
            count,
            limit,
            envs.iter()
                .filter(|e| merged.contains(&e.branch_name))
                .count(),
            stale_ids.len(),
        )];
        for env in &envs {
            let mut flags = Vec::new();
            if merged.contains(&env.branch_name) {
                flags.push("merged");
            }
            if stale_ids.contains(&env.id) {
                flags.push("stale");
            }
            let suffix = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            lines.push(format!("- {}{}", env.branch_name, suffix));
        }
        Ok(lines.join("\n"))
    }
}

/// Derive the canonical clone path from `{clone}/worktrees/{branch}`.
fn canonical_from_working_path(path: &Path) -> Option<PathBuf> {
    let parent = path.parent()?;
    if parent.file_name()? == super::worktree::WORKTREES_DIR {
        parent.parent().map(Path::to_path_buf)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewCodebase;
    use crate::types::AssistantType;

    async fn init_repo(root: &Path) {
        gitio::run_git(root, &["init", "-b", "main"]).await.unwrap();
        gitio::run_git(root, &["config", "user.email", "t@t"]).await.unwrap();
        gitio::run_git(root, &["config", "user.name", "t"]).await.unwrap();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        gitio::run_git(root, &["add", "."]).await.unwrap();
        gitio::run_git(root, &["commit", "-m", "init"]).await.unwrap();
    }

    async fn setup() -> (tempfile::TempDir, Arc<Store>, IsolationManager, Codebase) {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;

        let store = Arc::new(Store::in_memory().unwrap());
        let codebase = store
            .create_codebase(NewCodebase {
                name: "acme/app".into(),
                repository_url: None,
                default_cwd: dir.path().to_string_lossy().to_string(),
                ai_assistant_type: AssistantType::Claude,
            })
            .await
            .unwrap();
        let manager = IsolationManager::new(Arc::clone(&store), Settings::default());
        (dir, store, manager, codebase)
    }

    #[test]
    fn test_branch_name_validation() {
        assert!(valid_branch_name("feat-auth"));
        assert!(valid_branch_name("fix_123"));
        assert!(!valid_branch_name("feat/auth"));
        assert!(!valid_branch_name("bad name"));
        assert!(!valid_branch_name(""));
    }

    #[test]
    fn test_canonical_from_working_path() {
        assert_eq!(
            canonical_from_working_path(Path::new("/w/acme/app/worktrees/feat-x")),
            Some(PathBuf::from("/w/acme/app"))
        );
        assert_eq!(canonical_from_working_path(Path::new("/w/acme/app")), None);
    }

    #[tokio::test]
    async fn test_ensure_creates_then_reuses() {
        let (dir, store, manager, codebase) = setup().await;

        let outcome = manager
            .ensure_for_workflow(
                &codebase,
                dir.path(),
                EnsureRequest::task("feat-auth", "telegram"),
            )
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.env.workflow_id, "task-feat-auth");
        assert_eq!(outcome.env.branch_name, "feat-auth");
        assert!(outcome.env.working_path.ends_with("worktrees/feat-auth"));

        // Same identity returns the same environment.
        let again = manager
            .ensure_for_workflow(
                &codebase,
                dir.path(),
                EnsureRequest::task("feat-auth", "telegram"),
            )
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.env.id, outcome.env.id);
        assert_eq!(store.count_active_environments(&codebase.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pr_reuses_issue_worktree() {
        let (dir, store, manager, codebase) = setup().await;

        let issue_env = manager
            .ensure_for_workflow(
                &codebase,
                dir.path(),
                EnsureRequest {
                    workflow_type: WorkflowType::Issue,
                    workflow_id: "42".into(),
                    related_issues: vec![42],
                    created_by_platform: "github".into(),
                    branch_hint: None,
                    base_sha: None,
                },
            )
            .await
            .unwrap();

        let pr = manager
            .ensure_for_workflow(
                &codebase,
                dir.path(),
                EnsureRequest {
                    workflow_type: WorkflowType::Pr,
                    workflow_id: "7".into(),
                    related_issues: vec![42],
                    created_by_platform: "github".into(),
                    branch_hint: None,
                    base_sha: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(pr.reused_from_issue, Some(42));
        assert_eq!(pr.env.id, issue_env.env.id);
        assert_eq!(pr.env.metadata["pr_number"], "7");
        assert_eq!(store.count_active_environments(&codebase.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_destroy_refuses_dirty_then_forces() {
        let (dir, _store, manager, codebase) = setup().await;

        let outcome = manager
            .ensure_for_workflow(
                &codebase,
                dir.path(),
                EnsureRequest::task("feat-x", "telegram"),
            )
            .await
            .unwrap();
        let path = PathBuf::from(&outcome.env.working_path);
        std::fs::write(path.join("dirty.txt"), "uncommitted").unwrap();

        let refused = manager
            .destroy(&outcome.env, DestroyOptions::default())
            .await;
        assert!(matches!(refused, Err(IsolationError::UncommittedChanges(_))));
        assert!(path.exists());

        manager
            .destroy(
                &outcome.env,
                DestroyOptions {
                    force: true,
                    branch_name: Some("feat-x".into()),
                    canonical_repo_path: Some(dir.path().to_path_buf()),
                },
            )
            .await
            .unwrap();
        assert!(!path.exists());
        assert!(!gitio::branch_exists(dir.path(), "feat-x").await);
    }

    #[tokio::test]
    async fn test_destroy_missing_path_marks_row() {
        let (dir, store, manager, codebase) = setup().await;
        let outcome = manager
            .ensure_for_workflow(
                &codebase,
                dir.path(),
                EnsureRequest::task("feat-y", "telegram"),
            )
            .await
            .unwrap();

        // Simulate external removal.
        std::fs::remove_dir_all(&outcome.env.working_path).unwrap();

        manager
            .destroy(&outcome.env, DestroyOptions::default())
            .await
            .unwrap();
        let row = store.get_environment(&outcome.env.id).await.unwrap().unwrap();
        assert_eq!(row.status, EnvironmentStatus::Destroyed);
    }
}
