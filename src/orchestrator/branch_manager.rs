//! Branch Manager (§4.6): sanitizes task branch names and checks them out
//! via the `git` CLI, serialized per instance behind a process-global mutex
//! (DESIGN.md Open Question decision — option (c)) since a single working
//! tree can only have one branch checked out at a time.
//!
//! The subprocess invocation pattern (spawn, capture stdout/stderr, check
//! exit status) is the same discipline as [`crate::orchestrator::preflight`]'s
//! `ShellCommandRunner`, itself grounded on the donor's `BashTool::execute`.

use crate::orchestrator::error::BranchManagerError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex;

const MAX_BRANCH_NAME_LEN: usize = 120;

/// Strips a leading task-id prefix (a run of non-digit characters before
/// the first digit, e.g. `t42` -> `42`, `TASK-42` -> `42`) so the branch
/// name carries the bare numeric/opaque suffix rather than the prefix
/// convention the id happens to use (§4.6: "sanitized-id-without-task-prefix").
/// Ids with no digit at all (e.g. `s1` has one, but a purely alphabetic id
/// would not) are left untouched.
fn strip_task_prefix(id: &str) -> &str {
    match id.find(|c: char| c.is_ascii_digit()) {
        Some(idx) => &id[idx..],
        None => id,
    }
}

/// `implementation/{sanitized-id-without-task-prefix}-{sanitized-title}`,
/// lowercased, `[^a-z0-9]+` collapsed to single `-`, trimmed of
/// leading/trailing `-`, truncated to 120 chars, and re-trimmed of a
/// trailing `-` left by truncation (§4.6).
pub fn sanitize_branch_name(task_id: &str, title: &str) -> String {
    let sanitized_id = sanitize_component(strip_task_prefix(task_id));
    let sanitized_title = sanitize_component(title);
    let mut name = format!("implementation/{}-{}", sanitized_id, sanitized_title);
    if name.len() > MAX_BRANCH_NAME_LEN {
        name.truncate(MAX_BRANCH_NAME_LEN);
        name = name.trim_end_matches('-').to_string();
    }
    name
}

fn sanitize_component(s: &str) -> String {
    let lowered = s.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_sep = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('-');
            last_was_sep = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Matches `^[a-z0-9]+(?:[._/-][a-z0-9]+)*$` without a regex dependency: a
/// run of alphanumerics, then zero or more (separator, run-of-alphanumerics)
/// groups, with nothing left over (§4.6).
pub fn is_valid_branch_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut chars = name.chars().peekable();
    let mut saw_alnum_run = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() {
            chars.next();
            saw_alnum_run = true;
        } else {
            break;
        }
    }
    if !saw_alnum_run {
        return false;
    }
    while let Some(&sep) = chars.peek() {
        if !matches!(sep, '.' | '_' | '/' | '-') {
            return false;
        }
        chars.next();
        let mut run = false;
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() {
                chars.next();
                run = true;
            } else {
                break;
            }
        }
        if !run {
            return false;
        }
    }
    true
}

async fn run_git(workspace_root: &Path, args: &[&str]) -> Result<String, BranchManagerError> {
    let output = TokioCommand::new("git")
        .args(args)
        .current_dir(workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| BranchManagerError::VcsCommandFailed {
            command: format!("git {}", args.join(" ")),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(BranchManagerError::VcsCommandFailed {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn branch_exists(workspace_root: &Path, branch: &str) -> Result<bool, BranchManagerError> {
    let output = TokioCommand::new("git")
        .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
        .current_dir(workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| BranchManagerError::VcsCommandFailed {
            command: "git rev-parse --verify".to_string(),
            stderr: e.to_string(),
        })?;
    Ok(output.status.success())
}

/// Serializes all VCS operations against one working tree; a real deployment
/// holds one instance per workspace root.
pub struct BranchManager {
    workspace_root: std::path::PathBuf,
    lock: Mutex<()>,
}

impl BranchManager {
    pub fn new(workspace_root: impl Into<std::path::PathBuf>) -> Self {
        BranchManager {
            workspace_root: workspace_root.into(),
            lock: Mutex::new(()),
        }
    }

    /// Ensures `task_id`/`title`'s branch exists and is checked out,
    /// creating it off the current `HEAD` if necessary (§4.6). Returns the
    /// branch name.
    pub async fn ensure_task_branch_checked_out(
        &self,
        task_id: &str,
        title: &str,
    ) -> Result<String, BranchManagerError> {
        let _guard = self.lock.lock().await;
        let branch = sanitize_branch_name(task_id, title);
        if !is_valid_branch_name(&branch) {
            return Err(BranchManagerError::InvalidName(branch));
        }

        if branch_exists(&self.workspace_root, &branch).await? {
            run_git(&self.workspace_root, &["checkout", &branch]).await?;
        } else {
            run_git(&self.workspace_root, &["checkout", "-b", &branch]).await?;
        }
        Ok(branch)
    }

    /// Checks out a task's branch without creating it (§4.6): every
    /// transition other than `begin-implementation` assumes the branch
    /// already exists and fails with [`BranchManagerError::BranchMissing`]
    /// rather than silently originating one.
    pub async fn ensure_existing_task_branch_checked_out(
        &self,
        task_id: &str,
        title: &str,
    ) -> Result<String, BranchManagerError> {
        let _guard = self.lock.lock().await;
        let branch = sanitize_branch_name(task_id, title);
        if !is_valid_branch_name(&branch) {
            return Err(BranchManagerError::InvalidName(branch));
        }
        if !branch_exists(&self.workspace_root, &branch).await? {
            return Err(BranchManagerError::BranchMissing(branch));
        }
        run_git(&self.workspace_root, &["checkout", &branch]).await?;
        Ok(branch)
    }

    /// Checks out the repository's main integration branch (§4.6). Fails
    /// with [`BranchManagerError::BranchMissing`] rather than creating one —
    /// this transition never originates a main branch.
    pub async fn checkout_main_branch(&self, main_branch: &str) -> Result<(), BranchManagerError> {
        let _guard = self.lock.lock().await;
        if !branch_exists(&self.workspace_root, main_branch).await? {
            return Err(BranchManagerError::BranchMissing(main_branch.to_string()));
        }
        run_git(&self.workspace_root, &["checkout", main_branch]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_id_and_title_into_lowercase_hyphenated_branch() {
        let branch = sanitize_branch_name("TASK-42", "Add OAuth Login Flow!!");
        assert_eq!(branch, "implementation/42-add-oauth-login-flow");
    }

    #[test]
    fn scenario_begin_implementation_strips_task_id_prefix() {
        // §8 scenario 3: task `t42` titled "Fix cache eviction bug".
        let branch = sanitize_branch_name("t42", "Fix cache eviction bug");
        assert_eq!(branch, "implementation/42-fix-cache-eviction-bug");
    }

    #[test]
    fn collapses_repeated_separators_and_trims_edges() {
        let branch = sanitize_branch_name("  t1  ", "--weird___title--");
        assert_eq!(branch, "implementation/1-weird-title");
    }

    #[test]
    fn truncates_to_120_chars_and_strips_trailing_hyphen() {
        let long_title = "x".repeat(200);
        let branch = sanitize_branch_name("t1", &long_title);
        assert!(branch.len() <= MAX_BRANCH_NAME_LEN);
        assert!(!branch.ends_with('-'));
    }

    #[tokio::test]
    async fn ensure_existing_task_branch_fails_without_a_repo() {
        // No `.git` in the tempdir, so even the existence check's `git`
        // invocation fails closed rather than fabricating a branch.
        let dir = tempfile::tempdir().unwrap();
        let manager = BranchManager::new(dir.path());
        let result = manager
            .ensure_existing_task_branch_checked_out("t1", "Some task")
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn validates_well_formed_names() {
        assert!(is_valid_branch_name("implementation/t1-add-login"));
        assert!(is_valid_branch_name("main"));
        assert!(is_valid_branch_name("a.b_c/d-e"));
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(!is_valid_branch_name(""));
        assert!(!is_valid_branch_name("-leading-hyphen"));
        assert!(!is_valid_branch_name("double//slash"));
        assert!(!is_valid_branch_name("trailing-"));
    }
}
