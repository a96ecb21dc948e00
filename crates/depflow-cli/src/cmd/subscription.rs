use crate::cmd::{open_store, parse_uuid};
use crate::output::{or_dash, print_json, print_table};
use clap::Subcommand;
use depflow_core::model::{Subscription, SubscriptionPolicy};
use depflow_core::policy::MergePolicy;
use depflow_core::types::UpdateFrequency;
use std::path::Path;

#[derive(Subcommand)]
pub enum SubscriptionSubcommand {
    /// Subscribe a target branch to a source repository's builds on a channel
    Add {
        #[arg(long)]
        channel: u64,
        /// Source repository whose builds flow in
        #[arg(long)]
        source: String,
        /// Target repository receiving the pull requests
        #[arg(long)]
        target: String,
        /// Target branch the pull requests merge into
        #[arg(long)]
        branch: String,
        /// none, every_build, every_day, twice_daily, or every_week
        #[arg(long, default_value = "every_build")]
        frequency: String,
        /// Merge policy as NAME[=ARG,...] (repeatable), e.g. minimum_approvals=1
        #[arg(long = "policy", value_name = "POLICY")]
        policies: Vec<String>,
        /// Create the subscription disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List subscriptions
    List,
    /// Show a subscription and its pull-request actor state
    Show { id: String },
    /// Enable a subscription
    Enable { id: String },
    /// Disable a subscription; queued updates for it become no-ops
    Disable { id: String },
    /// Delete a subscription
    Delete { id: String },
}

pub fn run(root: &Path, subcmd: SubscriptionSubcommand, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    match subcmd {
        SubscriptionSubcommand::Add {
            channel,
            source,
            target,
            branch,
            frequency,
            policies,
            disabled,
        } => {
            let frequency: UpdateFrequency = frequency.parse()?;
            let mut policy = SubscriptionPolicy::new(frequency);
            for raw in &policies {
                let parsed: MergePolicy = raw.parse()?;
                parsed.validate()?;
                policy.merge_policies.push(parsed);
            }
            let mut sub = Subscription::new(channel, source, target, branch, policy);
            sub.enabled = !disabled;
            let sub = store.add_subscription(sub)?;
            if json {
                print_json(&sub)?;
            } else {
                println!("Created subscription {}", sub.id);
            }
        }
        SubscriptionSubcommand::List => {
            let subs = store.list_subscriptions()?;
            if json {
                print_json(&subs)?;
            } else if subs.is_empty() {
                println!("No subscriptions.");
            } else {
                let rows = subs
                    .into_iter()
                    .map(|s| {
                        vec![
                            s.id.to_string(),
                            s.channel_id.to_string(),
                            s.source_repository,
                            format!("{}@{}", s.target_repository, s.target_branch),
                            s.policy.update_frequency.to_string(),
                            if s.enabled { "yes" } else { "no" }.to_string(),
                            or_dash(s.last_applied_build_id),
                        ]
                    })
                    .collect();
                print_table(
                    &["ID", "CHANNEL", "SOURCE", "TARGET", "FREQUENCY", "ENABLED", "APPLIED"],
                    rows,
                );
            }
        }
        SubscriptionSubcommand::Show { id } => {
            let sub = store.get_subscription(parse_uuid(&id)?)?;
            let actor_id = sub.actor_id().to_string();
            let state = store.get_pr_state(&actor_id)?;
            if json {
                print_json(&serde_json::json!({
                    "subscription": sub,
                    "actor_id": actor_id,
                    "state": state,
                }))?;
            } else {
                println!("Subscription: {}", sub.id);
                println!("Source:       {} (channel {})", sub.source_repository, sub.channel_id);
                println!("Target:       {}@{}", sub.target_repository, sub.target_branch);
                println!("Frequency:    {}", sub.policy.update_frequency);
                println!("Enabled:      {}", sub.enabled);
                println!("Applied:      {}", or_dash(sub.last_applied_build_id));
                let names: Vec<&str> = sub.policy.merge_policies.iter().map(|p| p.name()).collect();
                println!(
                    "Policies:     {}",
                    if names.is_empty() { "-".to_string() } else { names.join(", ") }
                );
                match state {
                    Some(state) => {
                        println!("Actor:        {} ({})", actor_id, state.status);
                        if let Some(tracked) = &state.pull_request {
                            println!(
                                "Pull request: #{} for build {} {}",
                                tracked.pull_request.number,
                                tracked.build_id,
                                tracked.pull_request.url
                            );
                        }
                        if let Some(err) = &state.last_error {
                            println!("Last error:   {err}");
                        }
                    }
                    None => println!("Actor:        {actor_id} (idle)"),
                }
            }
        }
        SubscriptionSubcommand::Enable { id } => set_enabled(&store, &id, true, json)?,
        SubscriptionSubcommand::Disable { id } => set_enabled(&store, &id, false, json)?,
        SubscriptionSubcommand::Delete { id } => {
            let id = parse_uuid(&id)?;
            store.delete_subscription(id)?;
            if json {
                print_json(&serde_json::json!({ "deleted": id }))?;
            } else {
                println!("Deleted subscription {id}");
            }
        }
    }
    Ok(())
}

fn set_enabled(
    store: &depflow_core::store::FlowStore,
    id: &str,
    enabled: bool,
    json: bool,
) -> anyhow::Result<()> {
    let sub = store.set_subscription_enabled(parse_uuid(id)?, enabled)?;
    if json {
        print_json(&sub)?;
    } else {
        println!(
            "Subscription {} {}",
            sub.id,
            if enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}
