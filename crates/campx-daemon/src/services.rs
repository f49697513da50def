//! Store opening and service wiring.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use campx_core::store::{open_database, SqliteMarketStore};
use campx_core::ticket::SqliteTicketStore;
use campx_core::{
    ArbitrationEngine, Clock, ExpiryScheduler, MarketConfig, NotificationGateway, TicketService,
};
use tracing::info;

/// The core services sharing one database connection.
#[derive(Debug, Clone)]
pub struct Services {
    /// Claim arbitration over the market store.
    pub engine: Arc<ArbitrationEngine>,
    /// Verification tickets.
    pub tickets: Arc<TicketService>,
    /// Expiry sweep over both.
    pub scheduler: Arc<ExpiryScheduler>,
}

impl Services {
    /// Opens the configured database and wires every service over it.
    pub fn open(
        config: &MarketConfig,
        notifier: Arc<dyn NotificationGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let path = &config.store.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = open_database(path, config.store.busy_timeout())
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let conn = Arc::new(Mutex::new(conn));

        let market =
            SqliteMarketStore::new(Arc::clone(&conn)).context("failed to initialize market store")?;
        let ticket_store =
            SqliteTicketStore::new(conn).context("failed to initialize ticket store")?;

        let engine = Arc::new(ArbitrationEngine::new(
            Arc::new(market),
            notifier,
            Arc::clone(&clock),
            config,
        ));
        let tickets = Arc::new(TicketService::new(
            Arc::new(ticket_store),
            clock,
            config.tickets,
        ));
        let scheduler = Arc::new(ExpiryScheduler::new(
            Arc::clone(&engine),
            Arc::clone(&tickets),
            config.expiry,
        ));
        info!(path = %path.display(), "marketplace store opened");

        Ok(Self {
            engine,
            tickets,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use campx_core::model::{ItemStatus, LostFoundPost, ResourcePayload, ResourceState};
    use campx_core::{Actor, SystemClock, TracingNotifier};

    use super::*;

    fn config_at(path: std::path::PathBuf) -> MarketConfig {
        let mut config = MarketConfig::default();
        config.store.path = path;
        config
    }

    fn post() -> ResourcePayload {
        ResourcePayload::LostFound(LostFoundPost {
            title: "Umbrella".into(),
            description: "Blue, folding".into(),
            location: "Cafeteria".into(),
            status: ItemStatus::Found,
            contact: "desk@campus.example".into(),
        })
    }

    #[test]
    fn open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path().join("nested").join("market.sqlite"));
        Services::open(&config, Arc::new(TracingNotifier), Arc::new(SystemClock)).unwrap();
        assert!(config.store.path.exists());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path().join("market.sqlite"));

        let id = {
            let services =
                Services::open(&config, Arc::new(TracingNotifier), Arc::new(SystemClock))
                    .unwrap();
            services
                .engine
                .create_resource(&Actor::member("owner"), post())
                .unwrap()
                .id
        };

        let services =
            Services::open(&config, Arc::new(TracingNotifier), Arc::new(SystemClock)).unwrap();
        assert_eq!(
            services.engine.resource(&id).unwrap().state,
            ResourceState::Open
        );
    }
}
