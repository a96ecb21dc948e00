use crate::cmd::{open_queue, open_store, parse_uuid};
use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use depflow_core::queue::WorkItem;
use depflow_core::trigger::{DueUpdate, Trigger, TriggerEngine};
use depflow_core::types::UpdateFrequency;
use std::path::Path;
use std::sync::Arc;

#[derive(Subcommand)]
pub enum TriggerSubcommand {
    /// A build was published to a channel: enqueue every-build subscriptions
    Build {
        build: u64,
        #[arg(long)]
        channel: u64,
    },
    /// Run one periodic sweep for a frequency class
    Sweep {
        /// every_day, twice_daily, or every_week
        #[arg(long, default_value = "every_day")]
        frequency: String,
        /// RFC 3339 cut-off for eligible builds (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Re-run the merge policy check on a subscription's open pull request
    Check { subscription: String },
}

pub fn run(root: &Path, subcmd: TriggerSubcommand, json: bool) -> anyhow::Result<()> {
    let store = Arc::new(open_store(root)?);
    let queue = open_queue(root)?;
    let trigger = match subcmd {
        TriggerSubcommand::Build { build, channel } => Trigger::NewBuild {
            build_id: build,
            channel_id: channel,
        },
        TriggerSubcommand::Sweep { frequency, at } => {
            let frequency: UpdateFrequency = frequency.parse()?;
            let at = match at {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid --at '{raw}'"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            Trigger::Sweep { at, frequency }
        }
        TriggerSubcommand::Check { subscription } => {
            let actor = store.get_subscription(parse_uuid(&subscription)?)?.actor_id();
            let queue_id = queue.enqueue(WorkItem::pull_request_check(&actor))?;
            if json {
                print_json(&serde_json::json!({ "queue_id": queue_id, "actor_id": actor }))?;
            } else {
                println!("Enqueued pull request check for {actor} (item {queue_id})");
            }
            return Ok(());
        }
    };

    let due = TriggerEngine::new(store).fire(&trigger, &queue)?;
    print_due(&due, json)
}

fn print_due(due: &[DueUpdate], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&due);
    }
    if due.is_empty() {
        println!("No subscriptions due.");
        return Ok(());
    }
    let rows = due
        .iter()
        .map(|d| vec![d.subscription_id.to_string(), d.actor_id.to_string(), d.build_id.to_string()])
        .collect();
    print_table(&["SUBSCRIPTION", "ACTOR", "BUILD"], rows);
    println!("Enqueued {} update(s).", due.len());
    Ok(())
}
