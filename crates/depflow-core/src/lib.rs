pub mod actor;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod host;
pub mod model;
pub mod paths;
pub mod policy;
pub mod queue;
pub mod store;
pub mod trigger;
pub mod types;

pub use error::{FlowError, Result};
