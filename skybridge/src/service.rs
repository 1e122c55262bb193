use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bridge_store::{BridgeKind, DynBridgeStore};
use bridge_store_libsql::LibSqlBridgeStore;
use skybridge_task::{StopHandle, StopSignal, TaskHandle};
use tokio::runtime::{self, Runtime};

use crate::BridgeState;
use crate::bridge_account::BridgeAccountManager;
use crate::config::ConfHandle;
use crate::convert::ConverterRegistry;
use crate::federation::FederationContext;
use crate::firehose::FirehoseTask;
use crate::listener::HttpListener;
use crate::log;
use crate::pds::PdsClient;
use crate::poller::ConstellationTask;

pub const SERVICE_NAME: &str = "skybridge";

/// How long stopped workers get to wind down before the runtime is dropped
/// out from under them.
const STOP_GRACE: Duration = Duration::from_secs(15);

struct Running {
    stop_handle: StopHandle,
    runtime: Runtime,
}

pub struct BridgeService {
    conf_handle: ConfHandle,
    running: Option<Running>,
}

impl BridgeService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        log::init(conf.log_directive.as_deref()).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));
        trace!(?conf);

        Ok(BridgeService {
            conf_handle,
            running: None,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.running.is_none(), "service is already started");

        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        // spawn_tasks must run inside the runtime in order to bind sockets
        // and open the store.
        let TaskSet {
            workers, stop_handle, ..
        } = runtime.block_on(spawn_tasks(self.conf_handle.clone()))?;

        // One monitor per worker; a worker death is loud but does not take
        // its siblings down.
        for (name, worker) in workers {
            runtime.spawn(async move {
                match worker.join().await {
                    Ok(Ok(())) => debug!(task = name, "Worker finished"),
                    Ok(Err(error)) => error!(task = name, error = format!("{error:#}"), "Worker failed"),
                    Err(error) if error.is_cancelled() => trace!(task = name, "Worker cancelled"),
                    Err(error) => error!(task = name, %error, "Worker panicked"),
                }
            });
        }

        self.running = Some(Running { stop_handle, runtime });

        Ok(())
    }

    /// Requests a stop and waits for the workers to drain. Idempotent.
    pub fn stop(&mut self) {
        let Some(Running { stop_handle, runtime }) = self.running.take() else {
            debug!("Service is not running; nothing to stop");
            return;
        };

        info!("Stopping bridge service");

        stop_handle.request_stop();

        let drained = runtime.block_on(tokio::time::timeout(STOP_GRACE, stop_handle.drained()));
        match drained {
            Ok(()) => debug!("All workers drained"),
            Err(_) => warn!(grace_secs = STOP_GRACE.as_secs(), "Workers still running after the grace period"),
        }

        runtime.shutdown_background();
    }
}

/// The spawned workers plus the shared stop machinery.
struct TaskSet {
    workers: Vec<(&'static str, TaskHandle<anyhow::Result<()>>)>,
    stop_handle: StopHandle,
    stop_signal: StopSignal,
}

impl TaskSet {
    fn new() -> Self {
        let (stop_handle, stop_signal) = StopHandle::new();

        Self {
            workers: Vec::new(),
            stop_handle,
            stop_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: skybridge_task::Task<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = task.name();
        let worker = skybridge_task::spawn_task(task, self.stop_signal.clone());
        self.workers.push((name, worker));
    }
}

/// Builds the dependency graph in two phases (store and PDS client first,
/// everything depending on them second) and registers the long-lived
/// workers.
async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<TaskSet> {
    let conf = conf_handle.get_conf();

    let store: DynBridgeStore = Arc::new(
        LibSqlBridgeStore::open(&conf.db_location)
            .await
            .context("failed to open the store")?,
    );

    // Migrations run exactly once at startup; a failure aborts boot.
    store.setup().await.context("store setup failed")?;

    let pds = Arc::new(PdsClient::new(conf.pds_url.clone()).context("failed to build PDS client")?);

    let federation = Arc::new(FederationContext::new(Arc::clone(&conf), Arc::clone(&store), Arc::clone(&pds))?);
    let registry = Arc::new(ConverterRegistry::new());

    let mastodon_bridge = Arc::new(BridgeAccountManager::new(
        BridgeKind::Mastodon,
        conf.mastodon_bridge.clone(),
        conf.pds_admin_token.clone(),
        Arc::clone(&store),
        Arc::clone(&pds),
    ));
    let bluesky_bridge = Arc::new(BridgeAccountManager::new(
        BridgeKind::Bluesky,
        conf.bluesky_bridge.clone(),
        conf.pds_admin_token.clone(),
        Arc::clone(&store),
        Arc::clone(&pds),
    ));

    // Provisioning failures leave the bridge unavailable but don't take the
    // whole service down with them.
    for manager in [&mastodon_bridge, &bluesky_bridge] {
        if let Err(error) = manager.init().await {
            warn!(error = format!("{error:#}"), kind = %manager.kind(), "Bridge account initialization failed");
        }
    }

    let mut tasks = TaskSet::new();

    let state = BridgeState {
        conf_handle: conf_handle.clone(),
        store,
        pds: Arc::clone(&pds),
        federation,
        registry,
        mastodon_bridge,
        bluesky_bridge,
        stop_signal: tasks.stop_signal.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], conf.port));
    let listener = HttpListener::init_and_bind(addr, state.clone())
        .await
        .with_context(|| format!("failed to initialize listener on {addr}"))?;
    tasks.register(listener);

    if conf.firehose.enabled {
        tasks.register(FirehoseTask { state: state.clone() });
    } else {
        info!("Firehose processing is disabled");
    }

    if let Some(constellation) = conf.constellation.clone() {
        if state.bluesky_bridge.is_available() {
            let app_view = match &conf.app_view_url {
                Some(url) => Arc::new(PdsClient::new(url.clone()).context("failed to build AppView client")?),
                None => Arc::clone(&pds),
            };

            tasks.register(ConstellationTask::new(state.clone(), constellation, app_view)?);
        } else {
            warn!("Backlink service configured but the bluesky bridge is unavailable; poller not started");
        }
    }

    Ok(tasks)
}
