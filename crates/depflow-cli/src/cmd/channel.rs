use crate::cmd::open_store;
use crate::output::{print_json, print_table};
use clap::Subcommand;
use depflow_core::model::Channel;
use std::path::Path;

#[derive(Subcommand)]
pub enum ChannelSubcommand {
    /// Create a channel
    Add {
        name: String,
        /// Free-form classification, e.g. "product" or "tools"
        #[arg(long, default_value = "product")]
        classification: String,
    },
    /// List channels
    List,
}

pub fn run(root: &Path, subcmd: ChannelSubcommand, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    match subcmd {
        ChannelSubcommand::Add {
            name,
            classification,
        } => {
            let channel = store.add_channel(Channel::new(name, classification))?;
            if json {
                print_json(&channel)?;
            } else {
                println!("Created channel {} '{}'", channel.id, channel.name);
            }
        }
        ChannelSubcommand::List => {
            let channels = store.list_channels()?;
            if json {
                print_json(&channels)?;
            } else if channels.is_empty() {
                println!("No channels.");
            } else {
                let rows = channels
                    .into_iter()
                    .map(|c| vec![c.id.to_string(), c.name, c.classification])
                    .collect();
                print_table(&["ID", "NAME", "CLASSIFICATION"], rows);
            }
        }
    }
    Ok(())
}
