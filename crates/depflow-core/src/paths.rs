use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const DATA_DIR: &str = ".depflow";
pub const CONFIG_FILE: &str = "depflow.yaml";
pub const FLOW_DB: &str = ".depflow/flow.redb";
pub const QUEUE_DB: &str = ".depflow/queue.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn data_dir(root: &Path) -> PathBuf {
    root.join(DATA_DIR)
}

pub fn flow_db_path(root: &Path) -> PathBuf {
    root.join(FLOW_DB)
}

pub fn queue_db_path(root: &Path) -> PathBuf {
    root.join(QUEUE_DB)
}

pub fn is_initialized(root: &Path) -> bool {
    config_path(root).exists() && data_dir(root).is_dir()
}
