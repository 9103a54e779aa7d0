//! Thin async façade over the `git` CLI.
//!
//! Pure wrapper, no policy: every method maps to one git invocation and
//! reports failures with the action and git's stderr. Recovery decisions
//! (commit vs stash, when to pop) live in `recovery`; branch policy lives
//! in `pipeline`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::errors::GitError;

/// Handle on one working tree.
#[derive(Debug, Clone)]
pub struct GitFacade {
    repo_root: PathBuf,
}

impl GitFacade {
    /// Open a working tree, verifying it is a git repository.
    pub async fn open(repo_root: &Path) -> Result<Self, GitError> {
        let facade = Self {
            repo_root: repo_root.to_path_buf(),
        };
        let probe = facade.raw(&["rev-parse", "--git-dir"]).await?;
        if !probe.status.success() {
            return Err(GitError::NotARepository {
                path: repo_root.display().to_string(),
            });
        }
        Ok(facade)
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn raw(&self, args: &[&str]) -> Result<std::process::Output, GitError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(GitError::Spawn)
    }

    /// Run a git command, failing with `action` context on non-zero exit.
    async fn run(&self, args: &[&str], action: &str) -> Result<String, GitError> {
        let output = self.raw(args).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                action: action.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    // ---- status ----

    pub async fn status_porcelain(&self) -> Result<String, GitError> {
        self.run(&["status", "--porcelain"], "status").await
    }

    /// Whether the working tree has no staged, unstaged or untracked
    /// changes.
    pub async fn is_clean(&self) -> Result<bool, GitError> {
        Ok(self.status_porcelain().await?.trim().is_empty())
    }

    // ---- refs ----

    /// Current HEAD commit, `None` on an unborn branch.
    pub async fn head_sha(&self) -> Result<Option<String>, GitError> {
        let output = self.raw(&["rev-parse", "HEAD"]).await?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        Ok(self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"], "current branch")
            .await?
            .trim()
            .to_string())
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{}", name);
        let output = self.raw(&["show-ref", "--verify", "--quiet", &reference]).await?;
        Ok(output.status.success())
    }

    pub async fn remote_branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let reference = format!("refs/remotes/origin/{}", name);
        let output = self.raw(&["show-ref", "--verify", "--quiet", &reference]).await?;
        Ok(output.status.success())
    }

    /// Resolve a base ref: the local branch when it exists, otherwise
    /// `origin/<base>`.
    pub async fn resolve_base_ref(&self, base: &str) -> Result<String, GitError> {
        if self.branch_exists(base).await? {
            return Ok(base.to_string());
        }
        if self.remote_branch_exists(base).await? {
            return Ok(format!("origin/{}", base));
        }
        Err(GitError::CommandFailed {
            action: format!("resolve base ref \"{}\"", base),
            stderr: "no local branch and no origin branch with that name".to_string(),
        })
    }

    pub async fn create_branch(&self, name: &str, start_point: &str) -> Result<(), GitError> {
        self.run(
            &["checkout", "-b", name, start_point],
            &format!("create branch \"{}\" from \"{}\"", name, start_point),
        )
        .await?;
        Ok(())
    }

    pub async fn checkout(&self, name: &str) -> Result<(), GitError> {
        self.run(&["checkout", name], &format!("checkout \"{}\"", name))
            .await?;
        Ok(())
    }

    // ---- commits ----

    /// Stage everything (respecting ignore rules).
    pub async fn add_all(&self) -> Result<(), GitError> {
        self.run(&["add", "-A"], "stage all changes").await?;
        Ok(())
    }

    /// Create a commit; returns the new HEAD sha.
    pub async fn commit(&self, message: &str) -> Result<String, GitError> {
        self.run(&["commit", "-m", message], "commit").await?;
        self.head_sha().await?.ok_or_else(|| GitError::CommandFailed {
            action: "commit".to_string(),
            stderr: "HEAD missing after commit".to_string(),
        })
    }

    // ---- stash ----

    /// Create a named stash including untracked files.
    ///
    /// Returns `false` when the tree was clean and nothing was stashed.
    pub async fn stash_push(&self, name: &str) -> Result<bool, GitError> {
        let before = self.stash_depth().await?;
        let output = self.raw(&["stash", "push", "-u", "-m", name]).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                action: format!("stash push \"{}\"", name),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(self.stash_depth().await? > before)
    }

    /// Pop the most recent stash.
    ///
    /// An empty stash stack is the distinct [`GitError::EmptyStash`]; a
    /// merge conflict is surfaced, never swallowed - the tree is left in
    /// conflict for the user.
    pub async fn stash_pop(&self) -> Result<(), GitError> {
        if self.stash_depth().await? == 0 {
            return Err(GitError::EmptyStash);
        }
        let output = self.raw(&["stash", "pop"]).await?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{}{}", stdout, stderr);
            if combined.contains("CONFLICT") || combined.to_lowercase().contains("conflict") {
                return Err(GitError::StashConflict {
                    stderr: stderr.trim().to_string(),
                });
            }
            return Err(GitError::CommandFailed {
                action: "stash pop".to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    pub async fn stash_depth(&self) -> Result<usize, GitError> {
        let list = self.run(&["stash", "list"], "stash list").await?;
        Ok(list.lines().count())
    }

    // ---- diff / log ----

    /// Unified diff of `base...HEAD` (merge-base semantics).
    pub async fn diff_from(&self, base: &str) -> Result<String, GitError> {
        let spec = format!("{}...HEAD", base);
        self.run(&["diff", &spec], &format!("diff from \"{}\"", base))
            .await
    }

    /// `--stat` summary of the same range.
    pub async fn diff_stat_from(&self, base: &str) -> Result<String, GitError> {
        let spec = format!("{}...HEAD", base);
        self.run(
            &["diff", "--stat", &spec],
            &format!("diff stat from \"{}\"", base),
        )
        .await
    }

    pub async fn log_oneline(&self, count: usize) -> Result<String, GitError> {
        let limit = format!("-{}", count);
        self.run(&["log", "--oneline", &limit], "log").await
    }

    // ---- remote ----

    pub async fn fetch(&self) -> Result<(), GitError> {
        self.run(&["fetch", "--prune", "origin"], "fetch origin").await?;
        Ok(())
    }

    pub async fn push(&self, branch: &str) -> Result<(), GitError> {
        self.run(
            &["push", "-u", "origin", branch],
            &format!("push \"{}\"", branch),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    async fn init_repo() -> (GitFacade, TempDir) {
        let dir = TempDir::new().unwrap();
        let sh = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        sh(&["init", "-b", "main"]);
        sh(&["config", "user.name", "test"]);
        sh(&["config", "user.email", "test@test.invalid"]);
        let facade = GitFacade::open(dir.path()).await.unwrap();
        (facade, dir)
    }

    async fn commit_file(facade: &GitFacade, dir: &Path, name: &str, content: &str, msg: &str) {
        fs::write(dir.join(name), content).unwrap();
        facade.add_all().await.unwrap();
        facade.commit(msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let err = GitFacade::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, GitError::NotARepository { .. }));
    }

    #[tokio::test]
    async fn test_clean_and_dirty_detection() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;
        assert!(facade.is_clean().await.unwrap());

        fs::write(dir.path().join("b.txt"), "untracked\n").unwrap();
        assert!(!facade.is_clean().await.unwrap());
    }

    #[tokio::test]
    async fn test_head_sha_unborn_then_populated() {
        let (facade, dir) = init_repo().await;
        assert!(facade.head_sha().await.unwrap().is_none());
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;
        let sha = facade.head_sha().await.unwrap().unwrap();
        assert_eq!(sha.len(), 40);
    }

    #[tokio::test]
    async fn test_branch_create_and_checkout() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;

        facade.create_branch("phase/1-foundation", "main").await.unwrap();
        assert_eq!(facade.current_branch().await.unwrap(), "phase/1-foundation");
        assert!(facade.branch_exists("phase/1-foundation").await.unwrap());

        facade.checkout("main").await.unwrap();
        assert_eq!(facade.current_branch().await.unwrap(), "main");
    }

    #[tokio::test]
    async fn test_resolve_base_ref_prefers_local() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;
        assert_eq!(facade.resolve_base_ref("main").await.unwrap(), "main");

        let err = facade.resolve_base_ref("no-such-branch").await.unwrap_err();
        assert!(err.to_string().contains("resolve base ref"));
    }

    #[tokio::test]
    async fn test_stash_push_and_pop_roundtrip() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;

        fs::write(dir.path().join("wip.txt"), "partial work\n").unwrap();
        let stashed = facade.stash_push("raven: rate-limit during T-003").await.unwrap();
        assert!(stashed);
        assert!(facade.is_clean().await.unwrap());
        assert_eq!(facade.stash_depth().await.unwrap(), 1);

        facade.stash_pop().await.unwrap();
        assert!(dir.path().join("wip.txt").exists());
        assert_eq!(facade.stash_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stash_push_on_clean_tree_is_noop() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;

        let stashed = facade.stash_push("raven: nothing").await.unwrap();
        assert!(!stashed);
        assert_eq!(facade.stash_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stash_pop_empty_is_distinct_error() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;

        let err = facade.stash_pop().await.unwrap_err();
        assert!(matches!(err, GitError::EmptyStash));
    }

    #[tokio::test]
    async fn test_stash_pop_conflict_is_loud_and_leaves_tree() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;

        // Stash a modification, then commit a conflicting change.
        fs::write(dir.path().join("a.txt"), "stashed change\n").unwrap();
        assert!(facade.stash_push("raven: wip").await.unwrap());
        commit_file(&facade, dir.path(), "a.txt", "committed change\n", "conflicting").await;

        let err = facade.stash_pop().await.unwrap_err();
        assert!(matches!(err, GitError::StashConflict { .. }));
    }

    #[tokio::test]
    async fn test_diff_and_stat_from_base() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "init").await;
        facade.create_branch("phase/1-x", "main").await.unwrap();
        commit_file(&facade, dir.path(), "b.txt", "two\n", "feature work").await;

        let diff = facade.diff_from("main").await.unwrap();
        assert!(diff.contains("b.txt"));
        assert!(diff.contains("+two"));

        let stat = facade.diff_stat_from("main").await.unwrap();
        assert!(stat.contains("b.txt"));
    }

    #[tokio::test]
    async fn test_error_carries_git_prefix_and_stderr() {
        let (facade, _dir) = init_repo().await;
        let err = facade.run(&["diff", "nope...HEAD"], "diff from \"nope\"").await;
        let msg = err.unwrap_err().to_string();
        assert!(msg.starts_with("git: diff from \"nope\""));
    }

    #[tokio::test]
    async fn test_log_oneline() {
        let (facade, dir) = init_repo().await;
        commit_file(&facade, dir.path(), "a.txt", "one\n", "first").await;
        commit_file(&facade, dir.path(), "a.txt", "two\n", "second").await;
        let log = facade.log_oneline(5).await.unwrap();
        assert!(log.contains("first"));
        assert!(log.contains("second"));
    }
}
