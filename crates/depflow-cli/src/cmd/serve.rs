use crate::cmd::{open_queue, open_store};
use anyhow::{bail, Context};
use depflow_core::config::{EngineConfig, WarnLevel};
use depflow_core::dispatch::{ActorFactory, Dispatcher};
use depflow_core::host::{DryRunHost, SourceControlHost};
use depflow_core::trigger::run_periodic_sweeps;
use depflow_server::AppState;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the engine until Ctrl-C: recovery, dispatcher workers, one sweep
/// ticker per periodic frequency, and the HTTP API.
///
/// Pull requests go to the in-process dry-run host.
pub fn run(root: &Path, port: Option<u16>) -> anyhow::Result<()> {
    let config = EngineConfig::load(root).context("failed to load config")?;
    let warnings = config.validate();
    for w in &warnings {
        warn!(level = ?w.level, "config: {}", w.message);
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        bail!("config validation found errors; run 'depflow config validate'");
    }

    let store = Arc::new(open_store(root)?);
    let queue = Arc::new(open_queue(root)?);
    let recovered = store.recover_stuck_actors()?;
    if recovered > 0 {
        info!(recovered, "recovered stuck actors");
    }

    let port = port.unwrap_or(config.server.port);
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let cancel = CancellationToken::new();

        let host: Arc<dyn SourceControlHost> = Arc::new(DryRunHost::new());
        let factory = ActorFactory::new(store.clone(), host, config.actor_settings());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            factory,
            config.dispatcher_config(),
        ));
        let mut tasks = dispatcher.spawn(cancel.clone());

        let state = AppState::new(root.to_path_buf(), config.clone(), store, queue);
        for (frequency, period) in config.sweep_periods() {
            tasks.push(tokio::spawn(run_periodic_sweeps(
                state.engine.clone(),
                state.queue.clone(),
                frequency,
                period,
                cancel.clone(),
            )));
        }

        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            shutdown.cancel();
        });

        let served = depflow_server::serve(state, port, cancel.clone()).await;
        cancel.cancel();
        join_background(tasks).await;
        info!("depflow stopped");
        served
    })
}

/// Wait for every background task; returns how many ended abnormally.
async fn join_background(tasks: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_reports_panicked_tasks_and_waits_for_the_rest() {
        let tasks = vec![
            tokio::spawn(async {}),
            tokio::spawn(async { panic!("sweep blew up") }),
            tokio::spawn(async {}),
        ];
        assert_eq!(join_background(tasks).await, 1);
    }
}
