//! Git snapshot commands.

use anyhow::{bail, Context, Result};

use tether_core::git::{CheckoutOutcome, GitStateService};
use tether_core::model::{GitRestoreState, GitState};

use super::{GitRestoreArgs, GitStateArgs};

/// Run the git-state command.
pub async fn run_state(args: GitStateArgs) -> Result<()> {
    let config = super::load_config();
    let repo = super::repo_dir(args.repo)?;

    let service = GitStateService::new(&repo, config.git);
    let Some(state) = service.get_git_state().await else {
        bail!("Could not read git state of {}", repo.display());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        display_state(&state);
    }

    Ok(())
}

/// Run the git-restore command.
pub async fn run_restore(args: GitRestoreArgs) -> Result<()> {
    let config = super::load_config();
    let repo = super::repo_dir(args.repo)?;

    let raw = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let state: GitRestoreState =
        serde_json::from_slice(&raw).context("File is not a captured git state")?;
    tracing::debug!(head = %state.head, repo = %repo.display(), "Restoring git state");

    let report = GitStateService::new(&repo, config.git)
        .execute_git_restore(&state)
        .await;

    println!();
    println!("  Stashed local changes: {}", yes_no(report.stashed));
    let checkout = match &report.checkout {
        CheckoutOutcome::AlreadyAtHead => "already at recorded commit".to_string(),
        CheckoutOutcome::Branch(branch) => format!("branch {branch}"),
        CheckoutOutcome::Detached => format!("detached at {}", short(&state.head)),
        CheckoutOutcome::Failed => "failed".to_string(),
    };
    println!("  Checkout:              {checkout}");
    println!("  Patch applied:         {}", yes_no(report.patch_applied));
    if report.stashed {
        println!("  Stash restored:        {}", yes_no(report.stash_popped));
    }
    println!();

    if report.checkout == CheckoutOutcome::Failed {
        bail!("Checkout of {} failed; see log for details", short(&state.head));
    }
    Ok(())
}

fn display_state(state: &GitState) {
    println!();
    println!("  Remote:  {}", state.repo_url.as_deref().unwrap_or("(none)"));
    println!("  Head:    {}", state.head);
    println!(
        "  Branch:  {}",
        state.branch.as_deref().unwrap_or("(detached)")
    );
    println!("  Patch:   {} bytes", state.patch.len());
    println!("  Hash:    {}", GitStateService::hash_git_state(state));
    println!();
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn short(head: &str) -> &str {
    head.get(..10).unwrap_or(head)
}
