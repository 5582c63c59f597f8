//! Process wiring: opens the replicated store, builds the services around it
//! and serves the HTTP API until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use raft_store::forward::{ClusterCommand, ClusterOp, Forwarder};
use raft_store::{KvStore, RaftStore, StoreConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{AppState, router};
use crate::config::Settings;
use crate::connection::{ConnectionRegistry, SessionSettings};
use crate::instance::InstanceService;
use crate::namespace::ConfigService;
use crate::permission::AccessControl;
use crate::propagation::{HttpPeers, PropagationSettings, Propagator};

const JOIN_ATTEMPTS: u32 = 30;
const JOIN_BACKOFF: Duration = Duration::from_secs(1);

pub async fn run_until_ctrl_c(settings: Settings) -> Result<()> {
    let listener = TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    serve(settings, listener, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    })
    .await
}

pub async fn serve<F>(settings: Settings, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let raft_addr = settings.raft_addr()?;
    let mut config = StoreConfig::new(settings.node_id, raft_addr.clone(), settings.data_dir());
    config.bootstrap = settings.bootstrap;
    config.secret = settings.secret.clone();
    let raft = Arc::new(RaftStore::open(config).context("failed to open the replicated store")?);
    let store: Arc<dyn KvStore> = raft.clone();

    let (stop_tx, stop_rx) = watch::channel(false);
    let registry = Arc::new(ConnectionRegistry::new());
    let instances = Arc::new(InstanceService::new(store.clone()));
    let propagator = Propagator::new(
        store.clone(),
        instances.clone(),
        registry.clone(),
        Arc::new(HttpPeers::new(raft.forwarder().clone())),
        PropagationSettings::default(),
        stop_rx.clone(),
    );
    let state = AppState {
        configs: Arc::new(ConfigService::new(store.clone(), instances.clone(), propagator.clone())),
        access: Arc::new(AccessControl::new(store.clone(), settings.admins.clone())),
        store,
        instances,
        registry,
        propagator,
        inner_token: raft.inner_token().to_string(),
        session: SessionSettings::default(),
    };

    if let Some(seed) = settings.join.clone() {
        let command = ClusterCommand {
            cmd: ClusterOp::Join,
            node_id: settings.node_id,
            addr: raft_addr.clone(),
        };
        tokio::spawn(join_cluster(raft.forwarder().clone(), seed, command, stop_rx));
    }

    let local = listener.local_addr()?;
    info!(node = settings.node_id, http = %local, raft = %raft_addr, "config center listening");
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed");

    info!("shutting down");
    stop_tx.send_replace(true);
    raft.shutdown().await?;
    served
}

/// Asks `seed` to add this node, retrying until it answers or shutdown.
async fn join_cluster(
    forwarder: Forwarder,
    seed: String,
    command: ClusterCommand,
    mut shutdown: watch::Receiver<bool>,
) {
    for attempt in 1..=JOIN_ATTEMPTS {
        match forwarder.cluster_via(&seed, &command).await {
            Ok(()) => {
                info!(%seed, node = command.node_id, "joined cluster");
                return;
            }
            Err(err) => warn!(%seed, attempt, error = %err, "join request failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(JOIN_BACKOFF) => {}
            Ok(_) = shutdown.wait_for(|stop| *stop) => return,
        }
    }
    warn!(%seed, "giving up joining the cluster");
}
