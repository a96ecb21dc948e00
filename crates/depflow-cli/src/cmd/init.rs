use anyhow::Context;
use depflow_core::config::EngineConfig;
use depflow_core::paths;
use depflow_core::queue::WorkQueue;
use depflow_core::store::FlowStore;
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing depflow in: {}", root.display());

    let data = paths::data_dir(root);
    std::fs::create_dir_all(&data)
        .with_context(|| format!("failed to create {}", data.display()))?;

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        EngineConfig::default()
            .save(root)
            .with_context(|| format!("failed to write {}", paths::CONFIG_FILE))?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    for (rel, exists) in [
        (paths::FLOW_DB, paths::flow_db_path(root).exists()),
        (paths::QUEUE_DB, paths::queue_db_path(root).exists()),
    ] {
        println!("  {} {rel}", if exists { "exists: " } else { "created:" });
    }
    FlowStore::open(&paths::flow_db_path(root)).context("failed to create flow store")?;
    WorkQueue::open(&paths::queue_db_path(root)).context("failed to create work queue")?;

    Ok(())
}
