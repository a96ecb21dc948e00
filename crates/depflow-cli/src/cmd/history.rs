use crate::cmd::{open_queue, open_store, parse_uuid};
use crate::output::{or_dash, print_json, print_table};
use anyhow::bail;
use clap::Subcommand;
use depflow_core::history::HistoryQuery;
use std::path::Path;

#[derive(Subcommand)]
pub enum HistorySubcommand {
    /// List history items, newest first
    List {
        /// Target repository
        #[arg(long)]
        repo: Option<String>,
        /// Target branch
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show one history record
    Show { id: String },
    /// Re-enqueue the work item behind a failed history record
    Retry { id: String },
}

pub fn run(root: &Path, subcmd: HistorySubcommand, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    match subcmd {
        HistorySubcommand::List { repo, branch, limit } => {
            let records = store.list_history(&HistoryQuery {
                repository: repo,
                branch,
                subscription_id: None,
                limit: Some(limit),
            })?;
            if json {
                let items: Vec<_> = records.iter().map(|r| &r.item).collect();
                print_json(&items)?;
            } else if records.is_empty() {
                println!("No history.");
            } else {
                let rows = records
                    .into_iter()
                    .map(|r| {
                        vec![
                            r.id.to_string(),
                            r.item.timestamp().to_rfc3339(),
                            format!("{}@{}", r.item.repository_name(), r.item.branch_name()),
                            r.item.action().to_string(),
                            if r.item.success() { "ok" } else { "FAILED" }.to_string(),
                            or_dash(r.item.error_message().or(r.detail.as_deref())),
                        ]
                    })
                    .collect();
                print_table(&["ID", "TIME", "TARGET", "ACTION", "RESULT", "MESSAGE"], rows);
            }
        }
        HistorySubcommand::Show { id } => {
            let record = store.get_history(parse_uuid(&id)?)?;
            print_json(&record)?;
        }
        HistorySubcommand::Retry { id } => {
            let id = parse_uuid(&id)?;
            let record = store.get_history(id)?;
            if record.item.success() {
                bail!("history item {id} succeeded; nothing to retry");
            }
            let Some(item) = record.work_item else {
                bail!("history item {id} has no work item to retry");
            };
            let actor_id = item.actor_id.clone();
            let queue_id = open_queue(root)?.enqueue(item)?;
            if json {
                print_json(&serde_json::json!({ "queue_id": queue_id, "actor_id": actor_id }))?;
            } else {
                println!("Re-enqueued work item for {actor_id} (item {queue_id})");
            }
        }
    }
    Ok(())
}
