use std::path::{Path, PathBuf};
use std::sync::Arc;

use depflow_core::config::EngineConfig;
use depflow_core::paths;
use depflow_core::queue::WorkQueue;
use depflow_core::store::FlowStore;
use depflow_core::trigger::TriggerEngine;

/// Shared application state passed to all route handlers.
///
/// redb allows one open handle per file per process, so the store and queue
/// are shared with the dispatcher rather than reopened here.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub config: Arc<EngineConfig>,
    pub store: Arc<FlowStore>,
    pub queue: Arc<WorkQueue>,
    pub engine: Arc<TriggerEngine>,
}

impl AppState {
    pub fn new(
        root: PathBuf,
        config: EngineConfig,
        store: Arc<FlowStore>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            root,
            config: Arc::new(config),
            engine: Arc::new(TriggerEngine::new(store.clone())),
            store,
            queue,
        }
    }

    /// Load the config and open both databases under `root`.
    pub fn open(root: &Path) -> depflow_core::Result<Self> {
        let config = EngineConfig::load(root)?;
        let store = Arc::new(FlowStore::open(&paths::flow_db_path(root))?);
        let queue = Arc::new(WorkQueue::open(&paths::queue_db_path(root))?);
        Ok(Self::new(root.to_path_buf(), config, store, queue))
    }
}
