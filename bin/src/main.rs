#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod agent;
mod cli;
mod startup_health;
mod trace;

use agent::LogHandler;
use cli::Parser;
use config::CoordinationConfig;
use external_api::{ExternalApi, Health};
use startup_health::{verify_background_task_running, verify_task_running};
use zk_coordination::{CoordinationError, Coordinator, MemoryEnsemble, ZkClient};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    trace::init(&config.zkcoord_log, config.log_format)?;
    debug!(?config);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "failed to start agent");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(_) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing coordination config");
    let mut coord_cfg = CoordinationConfig::parse(&config.config_path)?;
    if let Some(id) = &config.service_id {
        coord_cfg.service_id = id.clone();
    }
    info!(service_id = %coord_cfg.service_id, prefix = %coord_cfg.prefix(), "using id");

    // no network client is linked in, the agent runs against the in-process service
    let ensemble = MemoryEnsemble::new();
    let client: Arc<dyn ZkClient> = Arc::new(ensemble.client());

    let mut builder = Coordinator::builder(coord_cfg.clone(), client)
        .on_connect(|| info!("coordination session ready"))
        .on_disconnect(|| warn!("coordination session unusable"));
    for cache in &coord_cfg.shared_caches {
        builder = builder.shared_cache(cache.path.clone(), Arc::new(LogHandler));
    }
    let coordinator = match builder.start().await {
        Ok(coordinator) => coordinator,
        Err(err @ CoordinationError::StartupTimeout(_)) => {
            error!(?err, "could not connect to coordination service, terminating");
            return Err(err.into());
        }
        Err(err) => return Err(err).context("failed to start coordinator"),
    };
    let mut state_worker = coordinator
        .state_worker()
        .context("session worker handle already taken")?;
    if !coordinator
        .wait_connected(Some(coord_cfg.session_timeout))
        .await
    {
        warn!("session not usable yet, continuing in the background");
    }

    if coordinator.is_connected() {
        agent::setup_party(&coordinator, &coord_cfg.party).await?;
    }

    // start external api for healthchecks
    let api = ExternalApi::new(config.external_api, coordinator.clone());
    let api_sender = api.sender();
    let mut api_task = api.start();

    let token = CancellationToken::new();
    let cache_workers = coordinator.run_shared_cache_handling();
    let mut heartbeat = agent::spawn_heartbeat(
        coordinator.clone(),
        config.heartbeat_interval(),
        token.clone(),
    );
    let mut maintenance = agent::spawn_maintenance(
        coordinator.clone(),
        config.maintenance_interval(),
        token.clone(),
    );

    // Keep health BAD until all startup-critical tasks are confirmed running.
    let checks = async {
        verify_background_task_running("external API", &mut api_task).await?;
        verify_task_running("session worker", &mut state_worker).await?;
        verify_task_running("heartbeat", &mut heartbeat).await?;
        verify_task_running("maintenance", &mut maintenance).await?;
        Ok::<_, anyhow::Error>(())
    };
    if let Err(err) = checks.await {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return Err(err).context("startup check failed");
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let result = tokio::select! {
        res = flatten(state_worker) => res.context("session worker exited"),
        res = flatten(heartbeat) => res.context("heartbeat exited"),
        res = flatten(maintenance) => res.context("maintenance exited"),
        res = supervise_caches(cache_workers) => res,
        res = signal::ctrl_c() => {
            info!("received shutdown signal");
            res.map_err(|err| anyhow!(err))
        }
    };

    let _ = api_sender.send(Health::Bad).await;
    token.cancel();
    if coordinator.have_lock() {
        if let Err(err) = coordinator.release_lock().await {
            warn!(?err, "failed to release lock on shutdown");
        }
    }
    api_task.abort();
    result
}

/// Resolves as soon as any cache worker ends; they only return on fatal errors.
async fn supervise_caches(workers: Vec<JoinHandle<Result<(), CoordinationError>>>) -> Result<()> {
    if workers.is_empty() {
        return std::future::pending().await;
    }
    let (res, idx, _rest) = futures::future::select_all(workers).await;
    match res {
        Ok(Ok(())) => Err(anyhow!("cache worker {idx} exited")),
        Ok(Err(err)) => Err(anyhow!(err)).with_context(|| format!("cache worker {idx} failed")),
        Err(err) => Err(anyhow!(err)).with_context(|| format!("cache worker {idx} panicked")),
    }
}

async fn flatten<T, E>(handle: JoinHandle<Result<T, E>>) -> Result<T, anyhow::Error>
where
    E: Into<anyhow::Error>,
{
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.into()),
        Err(err) => Err(anyhow!(err)),
    }
}
