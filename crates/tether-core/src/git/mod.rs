//! Git working-tree capture and restore.
//!
//! A [`GitState`] records where the working tree is (remote URL, HEAD commit,
//! branch) and what is uncommitted (a binary-safe patch against HEAD that
//! includes untracked files). Restoring replays that state on another
//! checkout of the same repository, step by step:
//!
//! 1. stash local changes
//! 2. check out the recorded commit (on its branch when it still points there)
//! 3. apply the recorded patch
//! 4. pop the stash, if step 1 stashed anything
//!
//! Every step is best-effort: a failure is logged and the remaining steps
//! still run.

use std::path::PathBuf;

use serde::Serialize;
use tokio::process::Command;
use xxhash_rust::xxh64::xxh64;

use crate::config::GitSettings;
use crate::error::{Error, Result};
use crate::model::{GitRestoreState, GitState};

/// Hash of git's empty tree object.
const EMPTY_TREE_HASH: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Paths passed to a single `git add`/`git reset` invocation.
const PATHSPEC_CHUNK: usize = 200;

/// How the checkout step of a restore went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// HEAD already was the recorded commit
    AlreadyAtHead,
    /// Checked out the recorded branch
    Branch(String),
    /// Checked out the recorded commit with a detached HEAD
    Detached,
    /// Checkout failed
    Failed,
}

/// What each step of a restore did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRestoreReport {
    /// Local changes were stashed
    pub stashed: bool,
    /// Checkout result
    pub checkout: CheckoutOutcome,
    /// The recorded patch was applied
    pub patch_applied: bool,
    /// The stash was popped back
    pub stash_popped: bool,
}

#[derive(Serialize)]
struct HashInput<'a> {
    head: &'a str,
    patch: &'a str,
    branch: Option<&'a str>,
}

/// Captures and restores the git state of one working tree.
#[derive(Debug, Clone)]
pub struct GitStateService {
    repo_dir: PathBuf,
    settings: GitSettings,
}

impl GitStateService {
    /// Create a service for the repository at `repo_dir`.
    #[must_use]
    pub fn new(repo_dir: impl Into<PathBuf>, settings: GitSettings) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            settings,
        }
    }

    /// Whether git state is captured during sync.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Stable content hash of a git state, for change detection.
    #[must_use]
    pub fn hash_git_state(state: &GitState) -> String {
        let input = HashInput {
            head: &state.head,
            patch: &state.patch,
            branch: state.branch.as_deref(),
        };
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        format!("{:016x}", xxh64(&bytes, 0))
    }

    /// Capture the current git state.
    ///
    /// Returns `None` (and logs) when the directory is not a repository or any
    /// git command fails.
    pub async fn get_git_state(&self) -> Option<GitState> {
        match self.capture().await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(
                    repo = %self.repo_dir.display(),
                    error = %e,
                    "Failed to capture git state"
                );
                None
            }
        }
    }

    async fn capture(&self) -> Result<GitState> {
        let head = self.git(&["rev-parse", "HEAD"]).await?.trim().to_string();
        let repo_url = self.first_remote_url().await;
        let branch = self
            .git(&["symbolic-ref", "--short", "-q", "HEAD"])
            .await
            .ok()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());

        let untracked = self.untracked_files().await?;
        let staged = self.stage_intent_to_add(&untracked).await;
        let patch = self.working_tree_patch().await;
        if staged {
            self.unstage(&untracked).await;
        }
        let mut patch = patch?;

        if patch.len() > self.settings.max_patch_bytes {
            tracing::warn!(
                patch_bytes = patch.len(),
                limit = self.settings.max_patch_bytes,
                "Git patch exceeds size limit; uploading metadata only"
            );
            patch.clear();
        }

        Ok(GitState {
            repo_url,
            head,
            branch,
            patch,
        })
    }

    async fn first_remote_url(&self) -> Option<String> {
        let remotes = self.git(&["remote"]).await.ok()?;
        let first = remotes.lines().map(str::trim).find(|r| !r.is_empty())?;
        self.git(&["remote", "get-url", first])
            .await
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
    }

    async fn untracked_files(&self) -> Result<Vec<String>> {
        let output = self
            .git(&["ls-files", "--others", "--exclude-standard", "-z"])
            .await?;
        Ok(output
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Stage untracked files as intent-to-add so `git diff` includes them.
    async fn stage_intent_to_add(&self, files: &[String]) -> bool {
        if files.is_empty() {
            return false;
        }
        let mut staged = false;
        for chunk in files.chunks(PATHSPEC_CHUNK) {
            let mut args = vec!["add", "--intent-to-add", "--"];
            args.extend(chunk.iter().map(String::as_str));
            match self.git(&args).await {
                Ok(_) => staged = true,
                Err(e) => tracing::warn!(error = %e, "Failed to stage untracked files"),
            }
        }
        staged
    }

    async fn unstage(&self, files: &[String]) {
        for chunk in files.chunks(PATHSPEC_CHUNK) {
            let mut args = vec!["reset", "-q", "--"];
            args.extend(chunk.iter().map(String::as_str));
            if let Err(e) = self.git(&args).await {
                tracing::warn!(error = %e, "Failed to unstage untracked files");
            }
        }
    }

    async fn working_tree_patch(&self) -> Result<String> {
        let patch = self.git_raw(&["diff", "HEAD", "--binary"]).await?;
        if patch.is_empty() && self.is_first_commit().await {
            let patch = self.git_raw(&["diff", EMPTY_TREE_HASH, "--binary"]).await?;
            return Ok(patch_text(patch));
        }
        Ok(patch_text(patch))
    }

    async fn is_first_commit(&self) -> bool {
        self.git(&["rev-list", "--count", "HEAD"])
            .await
            .is_ok_and(|count| count.trim() == "1")
    }

    /// Restore a recorded git state onto the working tree.
    ///
    /// Runs stash, checkout, patch and stash-pop in order. Each step logs its
    /// own failure and never prevents the later steps from running.
    pub async fn execute_git_restore(&self, state: &GitRestoreState) -> GitRestoreReport {
        tracing::info!(head = %state.head, branch = ?state.branch, "Restoring git state");

        let stashed = match self.stash().await {
            Ok(stashed) => stashed,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to stash local changes");
                false
            }
        };

        let checkout = match self.checkout(state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(head = %state.head, error = %e, "Failed to check out recorded commit");
                CheckoutOutcome::Failed
            }
        };

        let patch_applied = if state.patch.is_empty() {
            false
        } else {
            match self.apply_patch(&state.patch).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to apply recorded patch");
                    false
                }
            }
        };

        let stash_popped = if stashed {
            match self.git(&["stash", "pop"]).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to pop stash; changes remain in the stash list");
                    false
                }
            }
        } else {
            false
        };

        GitRestoreReport {
            stashed,
            checkout,
            patch_applied,
            stash_popped,
        }
    }

    /// Stash local changes; returns whether anything was stashed.
    async fn stash(&self) -> Result<bool> {
        let before = self.stash_count().await?;
        self.git(&[
            "stash",
            "push",
            "--include-untracked",
            "-m",
            "tether: local changes before session restore",
        ])
        .await?;
        let after = self.stash_count().await?;
        Ok(after > before)
    }

    async fn stash_count(&self) -> Result<usize> {
        Ok(self
            .git(&["stash", "list"])
            .await?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count())
    }

    async fn checkout(&self, state: &GitRestoreState) -> Result<CheckoutOutcome> {
        let current = self
            .git(&["rev-parse", "HEAD"])
            .await
            .ok()
            .map(|h| h.trim().to_string());
        if current.as_deref() == Some(state.head.as_str()) {
            return Ok(CheckoutOutcome::AlreadyAtHead);
        }

        if let Some(branch) = &state.branch {
            let reference = format!("refs/heads/{branch}");
            match self.git(&["rev-parse", "--verify", "-q", &reference]).await {
                Ok(tip) if tip.trim() == state.head => {
                    self.git(&["checkout", "-q", branch]).await?;
                    return Ok(CheckoutOutcome::Branch(branch.clone()));
                }
                Ok(_) => {
                    tracing::debug!(branch, "Branch moved since capture; checking out commit");
                }
                Err(e) => {
                    tracing::debug!(branch, error = %e, "Branch lookup failed; checking out commit");
                }
            }
        }

        self.git(&["checkout", "-q", "--detach", &state.head])
            .await?;
        Ok(CheckoutOutcome::Detached)
    }

    async fn apply_patch(&self, patch: &str) -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("tether-patch-")
            .tempdir()?;
        let patch_path = temp_dir.path().join("restore.patch");
        let patch_arg = patch_path.to_string_lossy().into_owned();

        let result = match tokio::fs::write(&patch_path, patch).await {
            Ok(()) => self
                .git(&["apply", "--whitespace=nowarn", &patch_arg])
                .await
                .map(|_| ()),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = temp_dir.close() {
            tracing::warn!(error = %e, "Failed to remove patch directory");
        }

        result
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let stdout = self.git_raw(args).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn git_raw(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|e| Error::Git(format!("failed to run git {}: {e}", args.join(" "))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!(
                "git {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

/// Patch bytes as text. Invalid UTF-8 is replaced, which makes the patch
/// unlikely to apply cleanly on restore.
fn patch_text(raw: Vec<u8>) -> String {
    String::from_utf8(raw).unwrap_or_else(|e| {
        let valid_up_to = e.utf8_error().valid_up_to();
        tracing::warn!(
            valid_up_to,
            "Git patch is not valid UTF-8; non-UTF-8 bytes were replaced"
        );
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn run(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git runs");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn init_repo(dir: &Path) {
        run(dir, &["init", "-q"]);
        run(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run(dir, &["config", "user.name", "Tether Test"]);
        run(dir, &["config", "user.email", "test@tether.dev"]);
        run(dir, &["config", "commit.gpgsign", "false"]);
    }

    fn commit_file(dir: &Path, name: &str, content: &str, message: &str) -> String {
        fs::write(dir.join(name), content).unwrap();
        run(dir, &["add", name]);
        run(dir, &["commit", "-q", "-m", message]);
        run(dir, &["rev-parse", "HEAD"])
    }

    fn service(dir: &Path) -> GitStateService {
        GitStateService::new(dir, GitSettings::default())
    }

    fn state(head: &str, branch: Option<&str>, patch: &str) -> GitState {
        GitState {
            repo_url: None,
            head: head.to_string(),
            branch: branch.map(str::to_string),
            patch: patch.to_string(),
        }
    }

    #[test]
    fn test_patch_text_replaces_invalid_utf8() {
        assert_eq!(patch_text(b"+caf\xc3\xa9\n".to_vec()), "+caf\u{e9}\n");

        let latin1 = patch_text(b"+caf\xe9\n".to_vec());
        assert_eq!(latin1, "+caf\u{fffd}\n");
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = state("abc", Some("main"), "diff");
        assert_eq!(
            GitStateService::hash_git_state(&a),
            GitStateService::hash_git_state(&a.clone())
        );
    }

    #[test]
    fn test_hash_changes_with_content() {
        let base = state("abc", Some("main"), "diff");
        let hash = GitStateService::hash_git_state(&base);

        assert_ne!(hash, GitStateService::hash_git_state(&state("abd", Some("main"), "diff")));
        assert_ne!(hash, GitStateService::hash_git_state(&state("abc", None, "diff")));
        assert_ne!(hash, GitStateService::hash_git_state(&state("abc", Some("main"), "diff2")));
    }

    #[test]
    fn test_hash_ignores_repo_url() {
        let mut with_url = state("abc", Some("main"), "diff");
        let without_url = with_url.clone();
        with_url.repo_url = Some("https://example.com/r.git".to_string());
        assert_eq!(
            GitStateService::hash_git_state(&with_url),
            GitStateService::hash_git_state(&without_url)
        );
    }

    #[tokio::test]
    async fn test_not_a_repository_returns_none() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        assert!(service(dir.path()).get_git_state().await.is_none());
    }

    #[tokio::test]
    async fn test_clean_repository() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.txt", "one\n", "first");
        let head = commit_file(dir.path(), "a.txt", "two\n", "second");
        run(dir.path(), &["remote", "add", "origin", "https://example.com/repo.git"]);

        let captured = service(dir.path()).get_git_state().await.unwrap();

        assert_eq!(captured.head, head);
        assert_eq!(captured.branch.as_deref(), Some("main"));
        assert_eq!(captured.repo_url.as_deref(), Some("https://example.com/repo.git"));
        assert!(captured.patch.is_empty());
    }

    #[tokio::test]
    async fn test_first_commit_diffs_against_empty_tree() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "only.txt", "hello\n", "first");

        let captured = service(dir.path()).get_git_state().await.unwrap();

        assert!(captured.patch.contains("only.txt"));
        assert!(captured.repo_url.is_none());
    }

    #[tokio::test]
    async fn test_patch_includes_untracked_and_unstages() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.txt", "one\n", "first");
        commit_file(dir.path(), "b.txt", "b\n", "second");
        fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        fs::write(dir.path().join("new.txt"), "brand new\n").unwrap();

        let captured = service(dir.path()).get_git_state().await.unwrap();

        assert!(captured.patch.contains("a.txt"));
        assert!(captured.patch.contains("new.txt"));
        assert!(captured.patch.contains("brand new"));

        let status = run(dir.path(), &["status", "--porcelain"]);
        assert!(status.contains("?? new.txt"), "untracked file was left staged: {status}");
    }

    #[tokio::test]
    async fn test_oversized_patch_dropped() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.txt", "one\n", "first");
        let head = commit_file(dir.path(), "b.txt", "b\n", "second");
        fs::write(dir.path().join("a.txt"), "x".repeat(4096)).unwrap();

        let settings = GitSettings {
            enabled: true,
            max_patch_bytes: 100,
        };
        let captured = GitStateService::new(dir.path(), settings)
            .get_git_state()
            .await
            .unwrap();

        assert_eq!(captured.head, head);
        assert!(captured.patch.is_empty());
    }

    #[tokio::test]
    async fn test_detached_head_has_no_branch() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let first = commit_file(dir.path(), "a.txt", "one\n", "first");
        commit_file(dir.path(), "a.txt", "two\n", "second");
        run(dir.path(), &["checkout", "-q", "--detach", &first]);

        let captured = service(dir.path()).get_git_state().await.unwrap();

        assert_eq!(captured.head, first);
        assert!(captured.branch.is_none());
    }

    #[tokio::test]
    async fn test_restore_replays_patch_and_keeps_local_changes() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.txt", "one\n", "first");
        commit_file(dir.path(), "b.txt", "b\n", "second");

        fs::write(dir.path().join("a.txt"), "edited remotely\n").unwrap();
        fs::write(dir.path().join("new.txt"), "created remotely\n").unwrap();
        let svc = service(dir.path());
        let captured = svc.get_git_state().await.unwrap();

        run(dir.path(), &["checkout", "-q", "--", "a.txt"]);
        fs::remove_file(dir.path().join("new.txt")).unwrap();
        fs::write(dir.path().join("b.txt"), "local edit\n").unwrap();

        let report = svc.execute_git_restore(&captured).await;

        assert!(report.stashed);
        assert_eq!(report.checkout, CheckoutOutcome::AlreadyAtHead);
        assert!(report.patch_applied);
        assert!(report.stash_popped);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "edited remotely\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("new.txt")).unwrap(),
            "created remotely\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("b.txt")).unwrap(),
            "local edit\n"
        );
    }

    #[tokio::test]
    async fn test_restore_clean_tree_does_not_stash() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.txt", "one\n", "first");
        let head = commit_file(dir.path(), "a.txt", "two\n", "second");

        let report = service(dir.path())
            .execute_git_restore(&state(&head, Some("main"), ""))
            .await;

        assert!(!report.stashed);
        assert!(!report.stash_popped);
        assert!(!report.patch_applied);
        assert_eq!(report.checkout, CheckoutOutcome::AlreadyAtHead);
    }

    #[tokio::test]
    async fn test_restore_checks_out_branch_when_it_matches() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let first = commit_file(dir.path(), "a.txt", "one\n", "first");
        run(dir.path(), &["branch", "feature"]);
        commit_file(dir.path(), "a.txt", "two\n", "second");

        let report = service(dir.path())
            .execute_git_restore(&state(&first, Some("feature"), ""))
            .await;

        assert_eq!(report.checkout, CheckoutOutcome::Branch("feature".to_string()));
        assert_eq!(run(dir.path(), &["symbolic-ref", "--short", "HEAD"]), "feature");
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\n");
    }

    #[tokio::test]
    async fn test_restore_detaches_when_branch_moved() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let first = commit_file(dir.path(), "a.txt", "one\n", "first");
        commit_file(dir.path(), "a.txt", "two\n", "second");

        let report = service(dir.path())
            .execute_git_restore(&state(&first, Some("main"), ""))
            .await;

        assert_eq!(report.checkout, CheckoutOutcome::Detached);
        assert_eq!(run(dir.path(), &["rev-parse", "HEAD"]), first);
    }

    #[tokio::test]
    async fn test_restore_continues_after_failed_checkout() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.txt", "one\n", "first");
        commit_file(dir.path(), "a.txt", "two\n", "second");
        fs::write(dir.path().join("a.txt"), "three\n").unwrap();
        let captured = service(dir.path()).get_git_state().await.unwrap();
        run(dir.path(), &["checkout", "-q", "--", "a.txt"]);

        let mut broken = captured.clone();
        broken.head = "0000000000000000000000000000000000000000".to_string();
        let report = service(dir.path()).execute_git_restore(&broken).await;

        assert_eq!(report.checkout, CheckoutOutcome::Failed);
        assert!(report.patch_applied);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "three\n");
    }
}
