use crate::cmd::open_store;
use crate::output::{print_json, print_table};
use clap::Subcommand;
use depflow_core::model::RepositoryInstallation;
use std::path::Path;

#[derive(Subcommand)]
pub enum InstallationSubcommand {
    /// Register (or replace) the host installation for a target repository
    Add {
        repository: String,
        installation_id: u64,
    },
    /// List installations
    List,
}

pub fn run(root: &Path, subcmd: InstallationSubcommand, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    match subcmd {
        InstallationSubcommand::Add {
            repository,
            installation_id,
        } => {
            let installation = RepositoryInstallation {
                repository_name: repository,
                installation_id,
            };
            store.put_installation(&installation)?;
            if json {
                print_json(&installation)?;
            } else {
                println!(
                    "Registered installation {} for {}",
                    installation.installation_id, installation.repository_name
                );
            }
        }
        InstallationSubcommand::List => {
            let installations = store.list_installations()?;
            if json {
                print_json(&installations)?;
            } else if installations.is_empty() {
                println!("No installations.");
            } else {
                let rows = installations
                    .into_iter()
                    .map(|i| vec![i.repository_name, i.installation_id.to_string()])
                    .collect();
                print_table(&["REPOSITORY", "INSTALLATION"], rows);
            }
        }
    }
    Ok(())
}
