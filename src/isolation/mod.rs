// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worktree-backed isolation environments.
//!
//! Every logical workflow (an issue, a PR, a named task) maps to exactly one
//! active working directory: a git worktree under the canonical clone's
//! `worktrees/` directory. The [`WorktreeOps`] layer wraps the git plumbing;
//! the [`IsolationManager`] owns the identity mapping, sharing rules, and
//! safety interlocks.

mod manager;
mod worktree;

pub use manager::{DestroyOptions, EnsureOutcome, EnsureRequest, IsolationManager};
pub use worktree::{is_worktree_path, WorktreeEntry, WorktreeOps};

pub(crate) use manager::valid_branch_name;
