use crate::cmd::open_store;
use crate::output::{print_json, print_table};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use depflow_core::model::{Asset, Build};
use std::path::Path;

#[derive(Subcommand)]
pub enum BuildSubcommand {
    /// Record a finished build
    Add {
        /// Source repository the build came from
        #[arg(long)]
        repo: String,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        number: String,
        #[arg(long)]
        commit: String,
        /// Shipping asset as NAME=VERSION (repeatable)
        #[arg(long = "asset", value_name = "NAME=VERSION")]
        assets: Vec<String>,
        /// Non-shipping asset as NAME=VERSION (repeatable); never triggers updates
        #[arg(long = "non-shipping", value_name = "NAME=VERSION")]
        non_shipping: Vec<String>,
        /// RFC 3339 production time (default: now)
        #[arg(long)]
        produced_at: Option<String>,
        /// Publish the build to this channel right away
        #[arg(long)]
        channel: Option<u64>,
    },
    /// List builds
    List,
    /// Publish a build to a channel
    Assign {
        build: u64,
        #[arg(long)]
        channel: u64,
    },
}

pub fn run(root: &Path, subcmd: BuildSubcommand, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    match subcmd {
        BuildSubcommand::Add {
            repo,
            branch,
            number,
            commit,
            assets,
            non_shipping,
            produced_at,
            channel,
        } => {
            let produced_at = match produced_at {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid --produced-at '{raw}'"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let mut build = Build::new(repo, branch, number, commit, produced_at);
            for raw in &assets {
                let (name, version) = parse_asset(raw)?;
                build = build.with_asset(Asset::shipping(name, version));
            }
            for raw in &non_shipping {
                let (name, version) = parse_asset(raw)?;
                build = build.with_asset(Asset::non_shipping(name, version));
            }
            let build = store.add_build(build)?;
            if let Some(channel) = channel {
                store.assign_build_to_channel(build.id, channel)?;
            }
            if json {
                print_json(&build)?;
            } else {
                println!("Created build {} ({} #{})", build.id, build.repository, build.build_number);
                if let Some(channel) = channel {
                    println!("Assigned to channel {channel}");
                }
            }
        }
        BuildSubcommand::List => {
            let builds = store.list_builds()?;
            if json {
                print_json(&builds)?;
            } else if builds.is_empty() {
                println!("No builds.");
            } else {
                let rows = builds
                    .into_iter()
                    .map(|b| {
                        let shipping = b.shipping_assets().count();
                        vec![
                            b.id.to_string(),
                            b.repository,
                            b.build_number,
                            b.produced_at.to_rfc3339(),
                            format!("{shipping}/{}", b.assets.len()),
                        ]
                    })
                    .collect();
                print_table(&["ID", "REPOSITORY", "NUMBER", "PRODUCED", "SHIPPING"], rows);
            }
        }
        BuildSubcommand::Assign { build, channel } => {
            let assignment = store.assign_build_to_channel(build, channel)?;
            if json {
                print_json(&assignment)?;
            } else {
                println!("Assigned build {build} to channel {channel}");
            }
        }
    }
    Ok(())
}

fn parse_asset(raw: &str) -> anyhow::Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((name, version)) if !name.trim().is_empty() && !version.trim().is_empty() => {
            Ok((name.trim(), version.trim()))
        }
        _ => bail!("invalid asset '{raw}': expected NAME=VERSION"),
    }
}
