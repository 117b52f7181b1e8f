//! Daemon wiring: builds the store, registry, channels, queue and pollers
//! from a `HearthConfig`, and starts the background workers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use hearth_core::config::HearthConfig;
use hearth_core::model::NewMessage;
use hearth_core::store::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::{Channel, HttpBridgeChannel, InboundHandler, LogChannel};
use crate::http::AppState;
use crate::ipc::{IpcWatcher, IpcWatcherConfig};
use crate::mailbox::IpcLayout;
use crate::message_loop::{Cursors, MessageLoop, MessageLoopConfig};
use crate::process_group::{RunContext, build_failure_fn, build_process_messages_fn};
use crate::queue::{GroupQueue, QueueConfig};
use crate::registry::GroupRegistry;
use crate::router::ChannelRouter;
use crate::sandbox::{RunnerConfig, SandboxRunner, SandboxSpawner, prepare_group_dirs};
use crate::schedule::resolve_timezone;
use crate::scheduler::{Scheduler, SchedulerLoopConfig};
use crate::scheduler_wiring::{TaskRunConfig, build_task_callback};

/// Pollers and dispatch state; absent when the orchestrator is disabled.
pub struct Orchestrator {
    pub run: RunContext,
    pub ipc: Arc<IpcWatcher>,
    pub message_loop: Arc<MessageLoop>,
    pub scheduler: Option<Arc<Scheduler>>,
}

pub struct AppContext {
    pub config: Arc<HearthConfig>,
    pub started_at: Instant,
    pub store: Store,
    pub registry: Arc<GroupRegistry>,
    pub router: ChannelRouter,
    pub bridge: Option<Arc<HttpBridgeChannel>>,
    pub orchestrator: Option<Orchestrator>,
}

impl AppContext {
    pub async fn build(config: HearthConfig, spawner: Arc<dyn SandboxSpawner>) -> anyhow::Result<Self> {
        let store = Store::open(&config.storage.database_path)?;
        let registry = Arc::new(GroupRegistry::load(&store)?);

        let bridge = if config.channel.http.enabled {
            let bridge = HttpBridgeChannel::new(&config.channel.http)?;
            if let Some(newest) = store.newest_message_timestamp()? {
                bridge.resume_after(&newest);
            }
            Some(Arc::new(bridge))
        } else {
            None
        };
        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
        if let Some(bridge) = &bridge {
            channels.push(bridge.clone());
        }
        channels.push(Arc::new(LogChannel));
        let router = ChannelRouter::new(channels);

        let inbound_store = store.clone();
        let on_message: InboundHandler = Arc::new(move |msg: NewMessage| inbound_store.store_message(&msg));
        for channel in router.channels() {
            channel
                .connect(on_message.clone())
                .await
                .with_context(|| format!("failed to connect channel {}", channel.name()))?;
        }

        let orchestrator = if config.orchestrator.enabled {
            Some(build_orchestrator(&config, &store, &registry, &router, spawner).await?)
        } else {
            info!("orchestrator disabled, serving http only");
            None
        };

        Ok(Self {
            config: Arc::new(config),
            started_at: Instant::now(),
            store,
            registry,
            router,
            bridge,
            orchestrator,
        })
    }

    /// Checks the runtime, clears orphans and spawns the pollers.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let Some(orch) = &self.orchestrator else {
            return Ok(Vec::new());
        };

        orch.run
            .runner
            .check_available()
            .await
            .context("container runtime is not available")?;
        orch.run.runner.reconcile_once().await;

        let mut workers = Vec::new();

        let ipc = orch.ipc.clone();
        let rx = shutdown.clone();
        workers.push(tokio::spawn(async move { ipc.run(rx).await }));

        let message_loop = orch.message_loop.clone();
        let rx = shutdown.clone();
        workers.push(tokio::spawn(async move { message_loop.run(rx).await }));

        if let Some(scheduler) = orch.scheduler.clone() {
            let rx = shutdown.clone();
            workers.push(tokio::spawn(async move { scheduler.run(rx).await }));
        } else {
            info!("scheduler disabled");
        }

        info!(
            groups = self.registry.len(),
            max_concurrent = self.config.orchestrator.max_concurrent_sandboxes,
            "orchestrator started"
        );
        Ok(workers)
    }

    /// Stops new dispatches. Running sandboxes are left to finish on their own.
    pub async fn shutdown(&self) {
        if let Some(orch) = &self.orchestrator {
            orch.run.queue.shutdown().await;
        }
    }

    pub fn http_state(&self) -> AppState {
        AppState {
            started_at: self.started_at,
            bind: self.config.server.bind.clone(),
            orchestrator_enabled: self.orchestrator.is_some(),
            queue: self.orchestrator.as_ref().map(|o| o.run.queue.clone()),
            registry: self.registry.clone(),
            bridge: self.bridge.clone(),
        }
    }
}

async fn build_orchestrator(
    config: &HearthConfig,
    store: &Store,
    registry: &Arc<GroupRegistry>,
    router: &ChannelRouter,
    spawner: Arc<dyn SandboxSpawner>,
) -> anyhow::Result<Orchestrator> {
    let orch_cfg = &config.orchestrator;
    let runner_config = RunnerConfig::from_config(config)?;
    let paths = runner_config.paths.clone();

    if let Some(primary) = registry.bootstrap_primary(store, orch_cfg)? {
        info!(jid = %primary.jid, group = %primary.folder, "primary group bootstrapped");
    }
    match registry.primary() {
        Some(primary) => prepare_group_dirs(&paths, &primary.folder)?,
        None => warn!("no primary group registered; operational ipc commands will be rejected"),
    }

    let layout = IpcLayout::new(&paths.data_dir);
    let queue = GroupQueue::new(
        QueueConfig {
            max_concurrent: orch_cfg.max_concurrent_sandboxes.max(1),
            ..QueueConfig::default()
        },
        layout.clone(),
    );
    let cursors = Cursors::load(store.clone());

    let run = RunContext {
        store: store.clone(),
        queue: queue.clone(),
        registry: registry.clone(),
        runner: Arc::new(SandboxRunner::new(spawner, runner_config)),
        router: router.clone(),
        cursors: cursors.clone(),
        layout,
        assistant_name: orch_cfg.assistant_name.clone(),
        prefix_assistant_name: orch_cfg.prefix_assistant_name,
        idle_timeout: Duration::from_millis(orch_cfg.idle_timeout_ms),
    };

    queue.set_process_messages_fn(build_process_messages_fn(run.clone())).await;
    queue.set_failure_fn(build_failure_fn(router.clone())).await;

    let timezone = resolve_timezone(&config.scheduler.timezone);
    let ipc = Arc::new(IpcWatcher::new(
        IpcWatcherConfig {
            poll_interval: Duration::from_millis(config.ipc.poll_interval_ms),
            timezone,
        },
        paths,
        store.clone(),
        registry.clone(),
        Arc::new(router.clone()),
    ));

    let message_loop = Arc::new(MessageLoop::new(
        MessageLoopConfig {
            poll_interval: Duration::from_millis(orch_cfg.poll_interval_ms),
            assistant_name: orch_cfg.assistant_name.clone(),
        },
        store.clone(),
        cursors,
        registry.clone(),
        queue,
    ));

    let scheduler = config.scheduler.enabled.then(|| {
        let on_task = build_task_callback(
            run.clone(),
            TaskRunConfig {
                timezone,
                close_delay: Duration::from_millis(config.scheduler.task_close_delay_ms),
            },
        );
        Arc::new(Scheduler::new(
            SchedulerLoopConfig {
                poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
            },
            store.clone(),
            on_task,
        ))
    });

    Ok(Orchestrator {
        run,
        ipc,
        message_loop,
        scheduler,
    })
}
