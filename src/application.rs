//! Application wiring: settings → TLS client → ledger → relay → router.
//!
//! All shared state is constructed once here and injected by handle; no
//! component reaches for globals, which is what keeps the relay testable
//! against a private pool and ledger.

use crate::config::Settings;
use crate::proxy::types::{LedgerCapacity, ModelName};
use crate::proxy::{Ledger, ProxyService, RelayEngine, RelaySettings, UpstreamPool, UpstreamTls};
use crate::{Error, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    router: Router,
    pool: Arc<UpstreamPool>,
}

impl Application {
    pub async fn new() -> Result<Self> {
        let settings = Settings::new()?;
        Self::from_settings(settings)
    }

    pub fn from_settings(settings: Settings) -> Result<Self> {
        let tls = settings
            .upstream
            .tls
            .as_ref()
            .map(|tls| {
                let server_name = tls
                    .server_name
                    .clone()
                    .unwrap_or_else(|| settings.upstream.host.clone());
                UpstreamTls::load(
                    &tls.client_cert_path,
                    &tls.client_key_path,
                    tls.ca_cert_path.as_deref(),
                    &server_name,
                    tls.verify_hostname,
                )
            })
            .transpose()?;

        if tls.is_none() {
            tracing::warn!("no upstream TLS configured; speaking plain HTTP to the upstream");
        }

        let pool = Arc::new(UpstreamPool::new(
            settings.upstream.authority(),
            tls,
            settings.relay.pool_idle_timeout(),
        ));

        let capacity = LedgerCapacity::try_new(settings.ledger.capacity).map_err(|_| {
            Error::Config(config::ConfigError::Message(
                "ledger.capacity must be greater than zero".to_string(),
            ))
        })?;
        let ledger = Arc::new(Ledger::new(capacity));

        let relay = RelayEngine::new(
            Arc::clone(&pool),
            Arc::clone(&ledger),
            RelaySettings {
                request_timeout: settings.relay.request_timeout(),
                idle_read_timeout: settings.relay.idle_read_timeout(),
            },
        );

        let models: Vec<ModelName> = settings
            .models
            .iter()
            .filter_map(|name| match ModelName::try_new(name.clone()) {
                Ok(model) => Some(model),
                Err(_) => {
                    tracing::warn!(model = %name, "ignoring empty model name in configuration");
                    None
                }
            })
            .collect();

        let service = ProxyService::new(relay, ledger, models, settings.relay.max_body_bytes);
        let router = service.into_router();

        Ok(Self {
            settings,
            router,
            pool,
        })
    }

    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.settings.application.host.parse()?,
            self.settings.application.port,
        );
        let listener = TcpListener::bind(addr).await?;

        // Periodic sweep so stale idle mTLS sessions are closed even when
        // no request comes along to discover them.
        let pool = Arc::clone(&self.pool);
        let sweep_interval = self
            .settings
            .relay
            .pool_idle_timeout()
            .max(std::time::Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                pool.prune_expired();
            }
        });

        info!(
            address = %addr,
            upstream = %self.settings.upstream.authority(),
            "tollbooth listening"
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("tollbooth stopped");
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The fully-wired router, for driving the service in-process.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_wires_up_from_defaults() {
        let settings = Settings::new().expect("default settings");
        let app = Application::from_settings(settings).expect("wire application");
        assert!(app.settings().application.port > 0);
    }
}
