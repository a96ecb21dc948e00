pub mod build;
pub mod channel;
pub mod config;
pub mod history;
pub mod init;
pub mod installation;
pub mod queue;
pub mod recover;
pub mod serve;
pub mod subscription;
pub mod trigger;

use std::path::Path;

use anyhow::Context;
use depflow_core::paths;
use depflow_core::queue::WorkQueue;
use depflow_core::store::FlowStore;
use depflow_core::FlowError;

fn ensure_initialized(root: &Path) -> anyhow::Result<()> {
    if !paths::is_initialized(root) {
        return Err(FlowError::NotInitialized.into());
    }
    Ok(())
}

pub(crate) fn open_store(root: &Path) -> anyhow::Result<FlowStore> {
    ensure_initialized(root)?;
    let path = paths::flow_db_path(root);
    FlowStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

pub(crate) fn open_queue(root: &Path) -> anyhow::Result<WorkQueue> {
    ensure_initialized(root)?;
    let path = paths::queue_db_path(root);
    WorkQueue::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

pub(crate) fn parse_uuid(raw: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).with_context(|| format!("invalid id '{raw}'"))
}
