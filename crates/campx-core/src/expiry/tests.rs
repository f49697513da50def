//! Sweep tests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::Connection;
use serde_json::json;

use super::*;
use crate::arbitration::{Actor, Decision};
use crate::clock::{Clock, ManualClock};
use crate::config::MarketConfig;
use crate::model::{
    ClaimRequest, ClaimState, ItemStatus, LostFoundPost, Resource, ResourcePayload, ResourceState,
};
use crate::notify::TracingNotifier;
use crate::store::SqliteMarketStore;
use crate::ticket::{SqliteTicketStore, TicketPurpose};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 5, 7, 30, 0).unwrap()
}

struct Fixture {
    engine: Arc<ArbitrationEngine>,
    tickets: Arc<TicketService>,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        let conn = Arc::new(Mutex::new(
            Connection::open_in_memory().expect("open in-memory db"),
        ));
        let config = MarketConfig::default();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = SqliteMarketStore::new(Arc::clone(&conn)).expect("market store");
        let ticket_store = SqliteTicketStore::new(conn).expect("ticket store");
        let engine = Arc::new(ArbitrationEngine::new(
            Arc::new(store),
            Arc::new(TracingNotifier),
            clock.clone(),
            &config,
        ));
        let tickets = Arc::new(TicketService::new(
            Arc::new(ticket_store),
            clock.clone(),
            config.tickets,
        ));
        Self {
            engine,
            tickets,
            clock,
        }
    }

    fn scheduler(&self, config: ExpiryConfig) -> ExpiryScheduler {
        ExpiryScheduler::new(Arc::clone(&self.engine), Arc::clone(&self.tickets), config)
    }

    fn post(&self) -> Resource {
        self.engine
            .create_resource(
                &Actor::member("owner"),
                ResourcePayload::LostFound(LostFoundPost {
                    title: "Headphones".into(),
                    description: "Over-ear, black".into(),
                    location: "Auditorium".into(),
                    status: ItemStatus::Found,
                    contact: "owner@campus.example".into(),
                }),
            )
            .expect("create post")
    }
}

fn item() -> ClaimRequest {
    ClaimRequest::Item {
        message: "mine".into(),
    }
}

#[tokio::test]
async fn sweep_expires_due_resources_and_cascades() {
    let fx = Fixture::new();
    let due = fx.post();
    let claim = fx
        .engine
        .create_claim(&Actor::member("alice"), &due.id, item())
        .await
        .unwrap();
    fx.clock.advance(Duration::days(3));
    let fresh = fx.post();

    fx.clock.advance(Duration::days(4));
    let report = fx.scheduler(ExpiryConfig::default()).sweep().await;
    assert_eq!(report.resources_expired, 1);
    assert_eq!(report.claims_cancelled, 1);
    assert_eq!(report.failures, 0);

    assert_eq!(fx.engine.resource(&due.id).unwrap().state, ResourceState::Expired);
    assert_eq!(fx.engine.claim(&claim.id).unwrap().state, ClaimState::Cancelled);
    assert_eq!(fx.engine.resource(&fresh.id).unwrap().state, ResourceState::Open);
}

#[tokio::test]
async fn sweep_never_touches_committed_resources() {
    let fx = Fixture::new();
    let post = fx.post();
    let claim = fx
        .engine
        .create_claim(&Actor::member("alice"), &post.id, item())
        .await
        .unwrap();
    fx.engine
        .decide(&Actor::member("owner"), &claim.id, Decision::Accept)
        .await
        .unwrap();

    fx.clock.advance(Duration::days(30));
    let report = fx.scheduler(ExpiryConfig::default()).sweep().await;
    assert_eq!(report.resources_expired, 0);
    assert_eq!(
        fx.engine.resource(&post.id).unwrap().state,
        ResourceState::Committed
    );
}

#[tokio::test]
async fn second_sweep_is_a_no_op() {
    let fx = Fixture::new();
    fx.post();
    fx.clock.advance(Duration::days(8));
    let scheduler = fx.scheduler(ExpiryConfig::default());

    assert_eq!(scheduler.sweep().await.resources_expired, 1);
    let again = scheduler.sweep().await;
    assert!(again.is_idle(), "{again:?}");
}

#[tokio::test]
async fn batch_limit_defers_the_rest() {
    let fx = Fixture::new();
    for _ in 0..5 {
        fx.post();
    }
    fx.clock.advance(Duration::days(8));
    let scheduler = fx.scheduler(ExpiryConfig {
        batch_limit: 2,
        ..ExpiryConfig::default()
    });

    assert_eq!(scheduler.sweep().await.resources_expired, 2);
    assert_eq!(scheduler.sweep().await.resources_expired, 2);
    assert_eq!(scheduler.sweep().await.resources_expired, 1);
    assert_eq!(scheduler.sweep().await.resources_expired, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sweeps_expire_each_resource_once() {
    let fx = Fixture::new();
    for _ in 0..20 {
        fx.post();
    }
    fx.clock.advance(Duration::days(8));

    let scheduler = Arc::new(fx.scheduler(ExpiryConfig::default()));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.sweep().await })
        })
        .collect();

    let mut expired = 0;
    for worker in workers {
        let report = worker.await.unwrap();
        assert_eq!(report.failures, 0);
        expired += report.resources_expired;
    }
    assert_eq!(expired, 20);
}

#[tokio::test]
async fn sweep_removes_expired_tickets() {
    let fx = Fixture::new();
    fx.tickets
        .issue("gina@campus.example", TicketPurpose::Signup, json!({}))
        .unwrap();
    let scheduler = fx.scheduler(ExpiryConfig::default());

    assert_eq!(scheduler.sweep().await.tickets_removed, 0);
    fx.clock.advance(Duration::minutes(6));
    assert_eq!(scheduler.sweep().await.tickets_removed, 1);
}

#[tokio::test]
async fn retention_purges_old_expired_resources() {
    let fx = Fixture::new();
    let post = fx.post();
    fx.clock.advance(Duration::days(8));
    let scheduler = fx.scheduler(ExpiryConfig {
        retention_days: Some(30),
        ..ExpiryConfig::default()
    });

    let first = scheduler.sweep().await;
    assert_eq!(first.resources_expired, 1);
    assert_eq!(first.purged, 0);

    fx.clock.advance(Duration::days(31));
    assert_eq!(scheduler.sweep().await.purged, 1);
    assert!(fx.engine.resource(&post.id).is_err());
}

#[tokio::test]
async fn scheduler_reports_configured_interval() {
    let fx = Fixture::new();
    let scheduler = fx.scheduler(ExpiryConfig {
        interval_secs: 42,
        ..ExpiryConfig::default()
    });
    assert_eq!(scheduler.interval(), std::time::Duration::from_secs(42));
    assert_eq!(fx.clock.now(), t0());
}
