use anyhow::Result;
use axum::Router;
use data_model::NetworkAddress;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{LocalBackendConfig, MembershipConfig, MembershipMode, ServerConfig, StaticBackendConfig},
    service::Service,
};

pub struct TestService {
    pub service: Service,
}

impl TestService {
    /// A service fed over the membership endpoint, running as
    /// `localhost:22000`. The membership updater is already running.
    pub async fn new() -> Result<Self> {
        Self::with_config(Self::base_config()).await
    }

    /// A service with a static membership of itself plus one other backend.
    pub async fn new_static() -> Result<Self> {
        let mut cfg = Self::base_config();
        cfg.membership = MembershipConfig {
            mode: MembershipMode::Static,
            static_backends: vec![
                StaticBackendConfig {
                    id: None,
                    address: NetworkAddress::new("localhost", 22000),
                    ip: Some("127.0.0.1".parse()?),
                    is_coordinator: true,
                    is_executor: true,
                },
                StaticBackendConfig {
                    id: Some("b1".to_string()),
                    address: NetworkAddress::new("host_1", 22000),
                    ip: Some("10.0.0.1".parse()?),
                    is_coordinator: false,
                    is_executor: true,
                },
            ],
            ..Default::default()
        };
        Self::with_config(cfg).await
    }

    async fn with_config(cfg: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        cfg.validate()?;
        let mut service = Service::new(cfg).await?;
        service.start_membership_updater();
        Ok(Self { service })
    }

    fn base_config() -> ServerConfig {
        ServerConfig {
            local_backend: LocalBackendConfig {
                ip: Some("127.0.0.1".parse().unwrap()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn router(&self) -> Router {
        self.service.routes()
    }
}
