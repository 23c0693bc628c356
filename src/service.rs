use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use axum_server::Handle;
use data_model::{BackendDescriptor, BackendId, MembershipDelta, MembershipEntry};
use metrics::{init_provider, scheduler_stats};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio::{
    self,
    signal,
    sync::{mpsc, watch},
};
use tracing::{error, info, warn};

use super::routes::RouteState;
use crate::{
    config::{MembershipMode, ServerConfig},
    routes::create_routes,
    scheduler::{
        membership::{resolve_address, ChannelMembership, MembershipSource, StaticMembership},
        Scheduler,
    },
};

/// A membership source waiting for the updater to be started, along with the
/// registrations it hands back when it is fed over a channel.
struct PendingMembership {
    source: Box<dyn MembershipSource>,
    registrations: Option<mpsc::Receiver<MembershipEntry>>,
}

pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub scheduler: Arc<Scheduler>,
    pub membership_tx: Option<mpsc::Sender<MembershipDelta>>,
    pending_membership: Option<PendingMembership>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let meter_provider = init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.telemetry.metrics_interval,
            Some(config.instance_id()),
            env!("CARGO_PKG_VERSION"),
        )
        .context("error initializing metrics provider")?;

        let local_address = config.local_backend.address();
        let local_ip = match config.local_backend.ip {
            Some(ip) => ip,
            None => resolve_address(&local_address)
                .await
                .with_context(|| format!("unable to resolve local backend {}", local_address))?,
        };
        let local_backend = BackendDescriptor {
            address: local_address,
            ip_address: local_ip,
            is_coordinator: config.local_backend.is_coordinator,
            is_executor: config.local_backend.is_executor,
        };
        let scheduler = Arc::new(Scheduler::new(
            config.local_backend.backend_id(),
            local_backend,
            &config.scheduler,
            Arc::new(scheduler_stats::Metrics::new()),
        ));

        let (pending_membership, membership_tx) = match config.membership.mode {
            MembershipMode::Static => {
                let source = StaticMembership::new(static_backends(&config).await)
                    .context("error initializing static membership")?;
                let pending = PendingMembership {
                    source: Box::new(source),
                    registrations: None,
                };
                (pending, None)
            }
            MembershipMode::Subscription => {
                let (source, feed) = ChannelMembership::new(config.membership.channel_capacity);
                let pending = PendingMembership {
                    source: Box::new(source),
                    registrations: Some(feed.registrations),
                };
                (pending, Some(feed.deltas))
            }
        };

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            scheduler,
            membership_tx,
            pending_membership: Some(pending_membership),
            meter_provider,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            scheduler: self.scheduler.clone(),
            membership_tx: self.membership_tx.clone(),
        }
    }

    pub fn routes(&self) -> Router {
        create_routes(self.route_state())
    }

    /// Spawns the membership updater. Registrations of the local backend are
    /// published back on the feed, the same way every other member's
    /// registration arrives. Does nothing if the updater already runs.
    pub fn start_membership_updater(&mut self) {
        let Some(pending) = self.pending_membership.take() else {
            return;
        };

        if let (Some(mut registrations), Some(membership_tx)) =
            (pending.registrations, self.membership_tx.clone())
        {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        registration = registrations.recv() => {
                            let Some(registration) = registration else {
                                return;
                            };
                            let delta = MembershipDelta::incremental(vec![registration], vec![]);
                            if membership_tx.send(delta).await.is_err() {
                                warn!("membership feed closed, dropping registration");
                                return;
                            }
                        }
                    }
                }
            });
        }

        let updater = self.scheduler.membership_updater();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            updater.run(pending.source, shutdown_rx).await;
        });
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_membership_updater();

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(self.routes().into_make_service())
            .await?;

        if let Some(meter_provider) = &self.meter_provider {
            if let Err(err) = meter_provider.shutdown() {
                error!("error shutting down meter provider: {:?}", err);
            }
        }
        Ok(())
    }
}

/// Resolves the statically configured backends. Entries that cannot be
/// resolved are skipped.
async fn static_backends(config: &ServerConfig) -> Vec<(BackendId, BackendDescriptor)> {
    let mut backends = Vec::with_capacity(config.membership.static_backends.len());
    for backend in &config.membership.static_backends {
        let ip = match backend.ip {
            Some(ip) => ip,
            None => match resolve_address(&backend.address).await {
                Ok(ip) => ip,
                Err(err) => {
                    warn!(
                        address = %backend.address,
                        "skipping static backend that failed to resolve: {:?}", err
                    );
                    continue;
                }
            },
        };
        backends.push((
            backend.backend_id(),
            BackendDescriptor {
                address: backend.address.clone(),
                ip_address: ip,
                is_coordinator: backend.is_coordinator,
                is_executor: backend.is_executor,
            },
        ));
    }
    info!(num_backends = backends.len(), "resolved static backends");
    backends
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    if shutdown_tx.send(()).is_err() {
        warn!("no background task is listening for shutdown");
    }
    info!("signal received, shutting down server gracefully");
}
