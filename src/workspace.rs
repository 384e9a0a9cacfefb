//! Workspace provisioning.
//!
//! The engine only needs "give me a directory bound to this branch"; how
//! that happens is behind [`WorkspaceProvisioner`]. The shipped
//! implementation uses `git worktree`.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Why a workspace could not be provisioned.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("{} is not inside a git repository", .0.display())]
    NotARepository(PathBuf),

    #[error("invalid branch name: {0:?}")]
    InvalidBranch(String),

    #[error("git {args} failed: {stderr}")]
    Git { args: String, stderr: String },

    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

/// Materializes an isolated working directory for a branch.
pub trait WorkspaceProvisioner: Send + Sync {
    /// Returns a usable working directory for `branch`, created from
    /// `base_branch` if the branch does not exist yet.
    fn provision(
        &self,
        base_dir: &Path,
        branch: &str,
        base_branch: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError>;
}

/// Provisions workspaces as git worktrees next to the repository:
/// `<parent>/<repo>-worktrees/<branch>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitWorktreeProvisioner;

fn git(dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = Command::new("git").current_dir(dir).args(args).output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(WorkspaceError::Git {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Turn a branch name into a single path component.
#[must_use]
pub fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.')
        .to_string()
}

impl GitWorktreeProvisioner {
    fn worktree_path(repo_root: &Path, branch: &str) -> PathBuf {
        let repo_name = repo_root
            .file_name()
            .map_or_else(|| "repo".to_string(), |n| n.to_string_lossy().into_owned());
        let parent = repo_root.parent().unwrap_or(repo_root);
        parent
            .join(format!("{repo_name}-worktrees"))
            .join(sanitize_branch(branch))
    }
}

impl WorkspaceProvisioner for GitWorktreeProvisioner {
    fn provision(
        &self,
        base_dir: &Path,
        branch: &str,
        base_branch: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError> {
        if branch.trim().is_empty() || sanitize_branch(branch).is_empty() {
            return Err(WorkspaceError::InvalidBranch(branch.to_string()));
        }
        git(base_dir, &["check-ref-format", "--branch", branch])
            .map_err(|_| WorkspaceError::InvalidBranch(branch.to_string()))?;

        let repo_root = git(base_dir, &["rev-parse", "--show-toplevel"])
            .map(PathBuf::from)
            .map_err(|_| WorkspaceError::NotARepository(base_dir.to_path_buf()))?;

        let path = Self::worktree_path(&repo_root, branch);
        if path.join(".git").exists() {
            tracing::debug!(path = %path.display(), "reusing existing worktree");
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().into_owned();
        let local_ref = format!("refs/heads/{branch}");
        let branch_exists = git(&repo_root, &["rev-parse", "--verify", "--quiet", local_ref.as_str()]).is_ok();

        if branch_exists {
            git(&repo_root, &["worktree", "add", path_str.as_str(), branch])?;
        } else {
            let mut args = vec!["worktree", "add", "-b", branch, path_str.as_str()];
            if let Some(base) = base_branch.filter(|b| !b.trim().is_empty()) {
                args.push(base);
            }
            git(&repo_root, &args)?;
        }

        tracing::info!(branch, path = %path.display(), "provisioned worktree");
        Ok(path)
    }
}

/// Current branch of the repository containing `dir`, if any.
#[must_use]
pub fn resolve_branch(dir: &Path) -> Option<String> {
    git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
        .ok()
        .filter(|b| !b.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = PathBuf::from(format!(
            "/tmp/agentdeck-ws-test-{}-{id}/repo",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn init_repo(dir: &Path) -> bool {
        let ok = |args: &[&str]| {
            Command::new("git")
                .current_dir(dir)
                .args(args)
                .output()
                .is_ok_and(|o| o.status.success())
        };
        ok(&["init", "-q", "-b", "main"])
            && ok(&["-c", "user.email=t@t", "-c", "user.name=t", "commit", "-q", "--allow-empty", "-m", "init"])
    }

    #[test]
    fn test_sanitize_branch() {
        assert_eq!(sanitize_branch("feature/login page"), "feature-login-page");
        assert_eq!(sanitize_branch("fix-1.2"), "fix-1.2");
        assert_eq!(sanitize_branch("///"), "");
    }

    #[test]
    fn test_not_a_repository() {
        let dir = scratch_dir();
        let result = GitWorktreeProvisioner.provision(&dir, "feature", None);
        assert!(result.is_err());
        assert_eq!(resolve_branch(&dir), None);
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[test]
    fn test_provision_and_reuse_worktree() {
        let dir = scratch_dir();
        if !init_repo(&dir) {
            // git unavailable in this environment
            return;
        }
        assert_eq!(resolve_branch(&dir).as_deref(), Some("main"));

        let path = GitWorktreeProvisioner
            .provision(&dir, "feature/x", Some("main"))
            .unwrap();
        assert!(path.ends_with("repo-worktrees/feature-x"));
        assert_eq!(resolve_branch(&path).as_deref(), Some("feature/x"));

        let again = GitWorktreeProvisioner.provision(&dir, "feature/x", None).unwrap();
        assert_eq!(again, path);

        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[test]
    fn test_invalid_branch() {
        let dir = scratch_dir();
        let result = GitWorktreeProvisioner.provision(&dir, "  ", None);
        assert!(matches!(result, Err(WorkspaceError::InvalidBranch(_))));
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }
}
