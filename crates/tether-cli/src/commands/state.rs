//! Workspace state command.

use std::sync::Arc;

use anyhow::Result;

use tether_core::ports::{PathProvider, WorkspacePaths};
use tether_core::session::{SessionPersistenceManager, SessionStateManager};

use super::StateArgs;

/// Run the state command.
pub async fn run(args: StateArgs) -> Result<()> {
    let path = match args.file {
        Some(path) => path,
        None => {
            WorkspacePaths::for_workspace(&std::env::current_dir()?).workspace_state_path()
        }
    };

    let persistence =
        SessionPersistenceManager::new(path.clone(), Arc::new(SessionStateManager::new()));
    let last = persistence.get_last_session().await;
    let map = persistence.get_task_session_map().await;

    if args.json {
        let output = serde_json::json!({
            "path": path,
            "lastSession": last,
            "taskSessionMap": map,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!("  State file: {}", path.display());
    match &last {
        Some(last) => println!("  Last session: {} (at {})", last.session_id, last.timestamp),
        None => println!("  Last session: (none)"),
    }
    println!();

    if map.is_empty() {
        println!("  No task mappings.");
    } else {
        println!("  {:36}  {:36}", "Task", "Session");
        println!("  {}", "─".repeat(74));
        for (task, session) in &map {
            println!("  {task:36}  {session:36}");
        }
    }
    println!();

    Ok(())
}
