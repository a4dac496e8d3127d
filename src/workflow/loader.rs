// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow discovery.
//!
//! Recursively reads `.archon/workflows/` (subdirectories included),
//! accepting `*.yaml` and `*.yml`. Invalid files are logged with one
//! aggregated warning and skipped; they never unload previously valid
//! workflows of other files.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::def::{parse_workflow, WorkflowDefinition};

/// Workflow directory relative to a clone root.
pub const WORKFLOWS_DIR: &str = ".archon/workflows";

/// Result of one discovery pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

/// In-memory registry of loaded workflows, keyed by name.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover workflows under `{clone}/.archon/workflows/`, replacing the
    /// current set.
    pub fn reload_from_clone(&self, clone_root: &Path) -> LoadReport {
        self.workflows.write().unwrap().clear();
        self.load_dir(&clone_root.join(WORKFLOWS_DIR))
    }

    /// Load every workflow file under `dir`, keeping already-loaded entries.
    pub fn load_dir(&self, dir: &Path) -> LoadReport {
        let mut report = LoadReport::default();
        if !dir.is_dir() {
            debug!("no workflow directory at {}", dir.display());
            return report;
        }

        let mut files: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                matches!(
                    entry.path().extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        for path in files {
            let path_display = path.display().to_string();
            let contents = match std::fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("failed to read workflow {}: {}", path_display, e);
                    report.rejected.push((path_display, e.to_string()));
                    continue;
                }
            };

            match parse_workflow(&path_display, &contents) {
                Ok(workflow) => {
                    let name = workflow.name.clone();
                    let previous = self
                        .workflows
                        .write()
                        .unwrap()
                        .insert(name.clone(), Arc::new(workflow));
                    if previous.is_some() {
                        warn!("workflow {} redefined by {}", name, path_display);
                    }
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!("{}", e);
                    report.rejected.push((path_display, e.to_string()));
                }
            }
        }

        report
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().unwrap().is_empty()
    }
}
