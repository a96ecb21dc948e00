use crate::cmd::{open_queue, open_store};
use crate::output::{print_json, print_table};
use clap::Subcommand;
use depflow_core::config::EngineConfig;
use depflow_core::dispatch::{ActorFactory, Dispatched, Dispatcher};
use depflow_core::host::DryRunHost;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Show ready, in-flight and delayed counts
    Stats,
    /// List queued work items in enqueue order
    List,
    /// Process queued items against the dry-run host until the queue is idle
    Drain {
        /// Stop after this many items
        #[arg(long, default_value = "1000")]
        max: usize,
    },
}

pub fn run(root: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        QueueSubcommand::Stats => {
            let stats = open_queue(root)?.stats()?;
            if json {
                print_json(&stats)?;
            } else {
                println!("ready:     {}", stats.ready);
                println!("in flight: {}", stats.in_flight);
                println!("delayed:   {}", stats.delayed);
                println!("enqueued:  {}", stats.total_enqueued);
                println!("acked:     {}", stats.total_acked);
            }
        }
        QueueSubcommand::List => {
            let items = open_queue(root)?.pending()?;
            if json {
                print_json(&items)?;
            } else if items.is_empty() {
                println!("Queue is empty.");
            } else {
                let rows = items
                    .into_iter()
                    .map(|i| {
                        vec![
                            i.actor_id,
                            serde_json::to_value(i.work_item_type)
                                .ok()
                                .and_then(|v| v.as_str().map(String::from))
                                .unwrap_or_default(),
                            i.payload.to_string(),
                        ]
                    })
                    .collect();
                print_table(&["ACTOR", "TYPE", "PAYLOAD"], rows);
            }
        }
        QueueSubcommand::Drain { max } => drain(root, max, json)?,
    }
    Ok(())
}

fn drain(root: &Path, max: usize, json: bool) -> anyhow::Result<()> {
    let config = EngineConfig::load(root)?;
    let store = Arc::new(open_store(root)?);
    let queue = Arc::new(open_queue(root)?);
    let factory = ActorFactory::new(store.clone(), Arc::new(DryRunHost::new()), config.actor_settings());
    let dispatcher = Dispatcher::new(store, queue, factory, config.dispatcher_config());

    let rt = tokio::runtime::Runtime::new()?;
    let results = rt.block_on(async {
        let cancel = CancellationToken::new();
        let mut results = Vec::new();
        while results.len() < max {
            match dispatcher.process_next("cli", &cancel).await? {
                Dispatched::Idle => break,
                other => results.push(other),
            }
        }
        Ok::<_, anyhow::Error>(results)
    })?;

    if json {
        return print_json(&results);
    }
    if results.is_empty() {
        println!("Queue is empty.");
    }
    for result in &results {
        match result {
            Dispatched::Processed { actor, outcome } => {
                println!("{actor}: {}", serde_json::to_string(outcome)?)
            }
            Dispatched::Deferred { actor } => println!("{actor}: deferred (lease held)"),
            Dispatched::Rejected { actor_id } => println!("{actor_id}: rejected (malformed actor id)"),
            Dispatched::Idle => {}
        }
    }
    Ok(())
}
