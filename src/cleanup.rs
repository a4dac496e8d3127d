// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worktree reclamation with safety interlocks.
//!
//! Three triggers feed the same machinery: adapter "conversation closed"
//! events, `/worktree cleanup` commands, and a periodic timer. An
//! environment is only removed when it is merged, stale, or its path is
//! gone, its working tree is clean, and no conversation references it.
//! Environments created from telegram are persistent workspaces: staleness
//! never reclaims them, merged-branch cleanup still does.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::StoreError;
use crate::gitio;
use crate::isolation::{DestroyOptions, IsolationManager, WorktreeOps};
use crate::lock::CancelToken;
use crate::store::{Codebase, Conversation, IsolationEnvironment, Store};

/// Outcome of one cleanup pass. Errors in one environment never abort the
/// pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Branch names of removed environments.
    pub removed: Vec<String>,
    pub skipped: Vec<SkippedEnv>,
    pub errors: Vec<EnvError>,
}

#[derive(Debug)]
pub struct SkippedEnv {
    pub id: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct EnvError {
    pub id: String,
    pub error: String,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.skipped.extend(other.skipped);
        self.errors.extend(other.errors);
    }

    /// Short human summary for command replies.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Removed {} worktree(s), skipped {}, {} error(s)",
            self.removed.len(),
            self.skipped.len(),
            self.errors.len()
        );
        for branch in &self.removed {
            out.push_str(&format!("\n- removed {}", branch));
        }
        for skipped in &self.skipped {
            out.push_str(&format!("\n- skipped {}: {}", skipped.id, skipped.reason));
        }
        for error in &self.errors {
            out.push_str(&format!("\n- error {}: {}", error.id, error.error));
        }
        out
    }
}

/// Why an environment is up for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    MissingPath,
    Merged,
    Stale,
}

/// Remove every merged environment of one codebase.
///
/// Free function so the isolation manager can run it for limit-driven
/// cleanup without owning a scheduler.
pub async fn cleanup_merged_for_codebase(
    store: &Arc<Store>,
    isolation: &IsolationManager,
    codebase: &Codebase,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let canonical = PathBuf::from(&codebase.default_cwd);

    let envs = match store.list_active_environments(Some(&codebase.id)).await {
        Ok(envs) => envs,
        Err(e) => {
            warn!("failed to list environments for {}: {}", codebase.name, e);
            return report;
        }
    };

    let main = gitio::main_branch(&canonical).await;
    let merged: HashSet<String> = gitio::merged_branches(&canonical, &main)
        .await
        .unwrap_or_default()
        .into_iter()
        .collect();

    for env in envs {
        let category = if !WorktreeOps::new(&canonical)
            .is_valid_worktree(Path::new(&env.working_path))
            .await
        {
            Some(Category::MissingPath)
        } else if merged.contains(&env.branch_name) {
            Some(Category::Merged)
        } else {
            None
        };
        if let Some(category) = category {
            try_remove(store, isolation, &canonical, &env, category, &mut report).await;
        }
    }

    report
}

/// Attempt removal of one categorized environment, honoring the safety
/// interlocks.
async fn try_remove(
    store: &Arc<Store>,
    isolation: &IsolationManager,
    canonical: &Path,
    env: &IsolationEnvironment,
    category: Category,
    report: &mut CleanupReport,
) {
    let path = Path::new(&env.working_path);
    let path_gone = category == Category::MissingPath || !path.exists();

    if !path_gone {
        match gitio::has_uncommitted_changes(path).await {
            Ok(true) => {
                report.skipped.push(SkippedEnv {
                    id: env.id.clone(),
                    reason: "uncommitted changes".into(),
                });
                return;
            }
            Ok(false) => {}
            Err(e) => {
                report.errors.push(EnvError {
                    id: env.id.clone(),
                    error: e.to_string(),
                });
                return;
            }
        }
    }

    match store.conversations_referencing_env(&env.id).await {
        Ok(refs) if !refs.is_empty() => {
            report.skipped.push(SkippedEnv {
                id: env.id.clone(),
                reason: format!("in use by {} conversation(s)", refs.len()),
            });
            return;
        }
        Ok(_) => {}
        Err(e) => {
            report.errors.push(EnvError {
                id: env.id.clone(),
                error: e.to_string(),
            });
            return;
        }
    }

    let result = isolation
        .destroy(
            env,
            DestroyOptions {
                // A missing or invalid worktree has nothing left to lose.
                force: category == Category::MissingPath,
                branch_name: Some(env.branch_name.clone()),
                canonical_repo_path: Some(canonical.to_path_buf()),
            },
        )
        .await;

    match result {
        Ok(()) => {
            debug!("cleanup removed {} ({:?})", env.branch_name, category);
            report.removed.push(env.branch_name.clone());
        }
        Err(e) => report.errors.push(EnvError {
            id: env.id.clone(),
            error: e.to_string(),
        }),
    }
}

/// Periodic and event-driven reclamation.
pub struct CleanupScheduler {
    store: Arc<Store>,
    isolation: Arc<IsolationManager>,
    settings: Settings,
}

impl CleanupScheduler {
    pub fn new(store: Arc<Store>, isolation: Arc<IsolationManager>, settings: Settings) -> Self {
        Self {
            store,
            isolation,
            settings,
        }
    }

    /// One full pass over every active environment.
    pub async fn run_cycle(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let envs = match self.store.list_active_environments(None).await {
            Ok(envs) => envs,
            Err(e) => {
                warn!("cleanup cycle failed to list environments: {}", e);
                return report;
            }
        };

        let stale_ids: HashSet<String> = match self
            .store
            .find_stale_environments(self.settings.stale_threshold_days)
            .await
        {
            Ok(stale) => stale.into_iter().map(|e| e.id).collect(),
            Err(e) => {
                warn!("cleanup cycle failed to query stale environments: {}", e);
                HashSet::new()
            }
        };

        // Merged-branch lists are per codebase; compute each once.
        let mut merged_by_codebase: HashMap<String, (PathBuf, HashSet<String>)> = HashMap::new();

        for env in envs {
            if !merged_by_codebase.contains_key(&env.codebase_id) {
                let canonical = match self.store.get_codebase(&env.codebase_id).await {
                    Ok(Some(codebase)) => PathBuf::from(codebase.default_cwd),
                    Ok(None) | Err(_) => PathBuf::from(&env.working_path)
                        .parent()
                        .and_then(Path::parent)
                        .map(Path::to_path_buf)
                        .unwrap_or_default(),
                };
                let main = gitio::main_branch(&canonical).await;
                let merged: HashSet<String> = gitio::merged_branches(&canonical, &main)
                    .await
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                merged_by_codebase.insert(env.codebase_id.clone(), (canonical, merged));
            }
            let Some((canonical, merged)) = merged_by_codebase.get(&env.codebase_id).cloned()
            else {
                continue;
            };

            let category = if !WorktreeOps::new(&canonical)
                .is_valid_worktree(Path::new(&env.working_path))
                .await
            {
                Some(Category::MissingPath)
            } else if merged.contains(&env.branch_name) {
                Some(Category::Merged)
            } else if stale_ids.contains(&env.id) {
                // The stale query already excludes telegram workspaces.
                Some(Category::Stale)
            } else {
                None
            };

            if let Some(category) = category {
                try_remove(
                    &self.store,
                    &self.isolation,
                    &canonical,
                    &env,
                    category,
                    &mut report,
                )
                .await;
            }
        }

        info!(
            "cleanup cycle: removed={} skipped={} errors={}",
            report.removed.len(),
            report.skipped.len(),
            report.errors.len()
        );
        report
    }

    /// Merged-branch cleanup for one codebase (`/worktree cleanup merged`).
    pub async fn cleanup_merged(&self, codebase: &Codebase) -> CleanupReport {
        cleanup_merged_for_codebase(&self.store, &self.isolation, codebase).await
    }

    /// Staleness cleanup across all codebases (`/worktree cleanup stale`).
    pub async fn cleanup_stale(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let stale = match self
            .store
            .find_stale_environments(self.settings.stale_threshold_days)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!("stale cleanup failed to query: {}", e);
                return report;
            }
        };

        for env in stale {
            let canonical = match self.store.get_codebase(&env.codebase_id).await {
                Ok(Some(codebase)) => PathBuf::from(codebase.default_cwd),
                Ok(None) | Err(_) => continue,
            };
            try_remove(
                &self.store,
                &self.isolation,
                &canonical,
                &env,
                Category::Stale,
                &mut report,
            )
            .await;
        }
        report
    }

    /// Adapter notification that a platform conversation closed (issue or
    /// PR closed). Deactivates the session, drops the environment link, and
    /// destroys the environment when nothing else references it.
    pub async fn on_conversation_closed(
        &self,
        conversation: &Conversation,
    ) -> Result<(), StoreError> {
        self.store.deactivate_sessions(&conversation.id).await?;

        let Some(env_id) = conversation.isolation_env_id.clone() else {
            return Ok(());
        };

        self.store
            .update_conversation(
                &conversation.id,
                crate::store::ConversationPatch {
                    isolation_env_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        let still_referenced = !self
            .store
            .conversations_referencing_env(&env_id)
            .await?
            .is_empty();
        if still_referenced {
            return Ok(());
        }

        if let Some(env) = self.store.get_environment(&env_id).await? {
            let result = self
                .isolation
                .destroy(
                    &env,
                    DestroyOptions {
                        force: false,
                        branch_name: Some(env.branch_name.clone()),
                        canonical_repo_path: None,
                    },
                )
                .await;
            if let Err(e) = result {
                // Uncommitted work stays put; the periodic cycle retries.
                warn!("close-triggered destroy of {} skipped: {}", env.id, e);
            }
        }
        Ok(())
    }

    /// Spawn the periodic cycle. Runs until the token fires.
    pub fn spawn_periodic(self: Arc<Self>, cancel: CancelToken) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.settings.cleanup_interval_hours * 60 * 60);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Consume the immediate first tick.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.run_cycle().await;
                    }
                    _ = cancel.cancelled() => {
                        debug!("cleanup scheduler stopped");
                        break;
                    }
                }
            }
        })
    }
}
