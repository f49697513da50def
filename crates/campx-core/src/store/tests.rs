//! Tests for the `SQLite` market store.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::Connection;

use super::*;
use crate::model::{
    ChangeCause, ClaimChange, ClaimPayload, ClaimState, Identity, ItemStatus, LostFoundPost,
    ResourceKind, ResourcePayload, ResourceState, RideOffer,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

fn store() -> SqliteMarketStore {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    SqliteMarketStore::new(Arc::new(Mutex::new(conn))).expect("create store")
}

fn post(title: &str) -> ResourcePayload {
    ResourcePayload::LostFound(LostFoundPost {
        title: title.into(),
        description: "grey zip pocket".into(),
        location: "Library".into(),
        status: ItemStatus::Lost,
        contact: "owner@campus.example".into(),
    })
}

fn ride() -> ResourcePayload {
    ResourcePayload::Ride(RideOffer {
        from: "North Gate".into(),
        to: "Old Town".into(),
        price: 80,
        via: Vec::new(),
        departure: t0() + Duration::days(1),
        seats: 3,
    })
}

fn open(store: &SqliteMarketStore, payload: ResourcePayload, at: DateTime<Utc>) -> Resource {
    let resource = Resource::open(
        Identity::new("owner"),
        payload,
        Some(at + Duration::hours(1)),
        at,
    );
    store.insert_resource(&resource).expect("insert resource");
    resource
}

fn claim(store: &SqliteMarketStore, resource: &Resource, who: &str) -> Claim {
    let claim = Claim::pending(
        resource.id.clone(),
        Identity::new(who),
        ClaimPayload::ItemClaim {
            message: "it is mine".into(),
        },
        t0(),
    );
    store.insert_claim(&claim).expect("insert claim");
    claim
}

// =============================================================================
// Reads and inserts
// =============================================================================

#[test]
fn resource_round_trips_through_storage() {
    let store = store();
    let resource = open(&store, ride(), t0());

    let loaded = store.resource(&resource.id).expect("load resource");
    assert_eq!(loaded, resource);
}

#[test]
fn unknown_ids_are_not_found() {
    let store = store();
    assert!(matches!(
        store.resource(&ResourceId::new("RES-missing")),
        Err(StoreError::ResourceNotFound { .. })
    ));
    assert!(matches!(
        store.claim(&ClaimId::new("CLM-missing")),
        Err(StoreError::ClaimNotFound { .. })
    ));
}

#[test]
fn claim_insert_bumps_resource_version() {
    let store = store();
    let resource = open(&store, post("Wallet"), t0());
    claim(&store, &resource, "alice");
    claim(&store, &resource, "bob");

    let snapshot = store.snapshot(&resource.id).expect("snapshot");
    assert_eq!(snapshot.resource.version, 2);
    assert_eq!(snapshot.claims.len(), 2);
}

#[test]
fn duplicate_live_claim_is_refused() {
    let store = store();
    let resource = open(&store, post("Wallet"), t0());
    claim(&store, &resource, "alice");

    let again = Claim::pending(
        resource.id.clone(),
        Identity::new("alice"),
        ClaimPayload::ItemClaim {
            message: String::new(),
        },
        t0(),
    );
    assert!(matches!(
        store.insert_claim(&again),
        Err(StoreError::DuplicateClaim { .. })
    ));
    // Failed insert must not leave the version bumped.
    assert_eq!(store.resource(&resource.id).unwrap().version, 1);
}

#[test]
fn claim_on_missing_or_closed_resource_is_refused() {
    let store = store();
    let ghost = Claim::pending(
        ResourceId::new("RES-ghost"),
        Identity::new("alice"),
        ClaimPayload::ItemClaim {
            message: String::new(),
        },
        t0(),
    );
    assert!(matches!(
        store.insert_claim(&ghost),
        Err(StoreError::ResourceNotFound { .. })
    ));

    let resource = open(&store, post("Keys"), t0());
    let withdraw = Changeset::on(&resource, ChangeCause::OwnerWithdrawal)
        .move_resource(&resource, ResourceState::Cancelled)
        .unwrap();
    store.commit(&withdraw, t0()).expect("withdraw");

    let late = Claim::pending(
        resource.id.clone(),
        Identity::new("alice"),
        ClaimPayload::ItemClaim {
            message: String::new(),
        },
        t0(),
    );
    assert!(matches!(
        store.insert_claim(&late),
        Err(StoreError::ResourceNotOpen { .. })
    ));
}

// =============================================================================
// Conditional commit
// =============================================================================

#[test]
fn commit_applies_all_changes_atomically() {
    let store = store();
    let resource = open(&store, post("Wallet"), t0());
    let alice = claim(&store, &resource, "alice");
    let bob = claim(&store, &resource, "bob");

    let snapshot = store.snapshot(&resource.id).unwrap();
    let changeset = Changeset::on(&snapshot.resource, ChangeCause::OwnerDecision)
        .move_resource(&snapshot.resource, ResourceState::Committed)
        .unwrap()
        .with_claim(ClaimChange::new(&alice, ClaimState::Accepted, ChangeCause::OwnerDecision).unwrap())
        .with_claim(ClaimChange::new(&bob, ClaimState::Rejected, ChangeCause::Cascade).unwrap());
    let at = t0() + Duration::minutes(5);
    store.commit(&changeset, at).expect("commit");

    let after = store.snapshot(&resource.id).unwrap();
    assert_eq!(after, snapshot.apply(&changeset, at));
    assert_eq!(after.resource.state, ResourceState::Committed);
    assert_eq!(after.claim(&alice.id).unwrap().state, ClaimState::Accepted);
    assert_eq!(after.claim(&bob.id).unwrap().state, ClaimState::Rejected);
}

#[test]
fn stale_version_rolls_back_everything() {
    let store = store();
    let resource = open(&store, post("Wallet"), t0());
    let alice = claim(&store, &resource, "alice");
    let snapshot = store.snapshot(&resource.id).unwrap();

    // A new claim lands after the snapshot was taken.
    let carol = claim(&store, &resource, "carol");

    let changeset = Changeset::on(&snapshot.resource, ChangeCause::OwnerDecision)
        .move_resource(&snapshot.resource, ResourceState::Committed)
        .unwrap()
        .with_claim(ClaimChange::new(&alice, ClaimState::Accepted, ChangeCause::OwnerDecision).unwrap());
    assert!(matches!(
        store.commit(&changeset, t0()),
        Err(StoreError::Stale { .. })
    ));

    let after = store.snapshot(&resource.id).unwrap();
    assert_eq!(after.resource.state, ResourceState::Open);
    assert_eq!(after.claim(&alice.id).unwrap().state, ClaimState::Pending);
    assert_eq!(after.claim(&carol.id).unwrap().state, ClaimState::Pending);
}

#[test]
fn claim_only_change_requires_matching_from_state() {
    let store = store();
    let resource = open(&store, post("Wallet"), t0());
    let alice = claim(&store, &resource, "alice");

    let reject = Changeset::on(&resource, ChangeCause::OwnerDecision)
        .with_claim(ClaimChange::new(&alice, ClaimState::Rejected, ChangeCause::OwnerDecision).unwrap());
    store.commit(&reject, t0()).expect("first reject");
    assert!(matches!(
        store.commit(&reject, t0()),
        Err(StoreError::Stale { .. })
    ));
}

#[test]
fn second_winner_is_blocked_by_index() {
    let store = store();
    let resource = open(&store, post("Wallet"), t0());
    let alice = claim(&store, &resource, "alice");
    let bob = claim(&store, &resource, "bob");

    let accept_alice = Changeset::on(&resource, ChangeCause::OwnerDecision)
        .with_claim(ClaimChange::new(&alice, ClaimState::Accepted, ChangeCause::OwnerDecision).unwrap());
    store.commit(&accept_alice, t0()).expect("accept alice");

    let accept_bob = Changeset::on(&resource, ChangeCause::OwnerDecision)
        .with_claim(ClaimChange::new(&bob, ClaimState::Accepted, ChangeCause::OwnerDecision).unwrap());
    assert!(matches!(
        store.commit(&accept_bob, t0()),
        Err(StoreError::Stale { .. })
    ));
}

#[test]
fn empty_changeset_is_a_no_op() {
    let store = store();
    let resource = open(&store, post("Wallet"), t0());
    store
        .commit(&Changeset::on(&resource, ChangeCause::Expiry), t0())
        .expect("empty commit");
    assert_eq!(store.resource(&resource.id).unwrap().version, 0);
}

// =============================================================================
// Deadline index and purge
// =============================================================================

#[test]
fn due_resources_orders_by_deadline_and_skips_closed() {
    let store = store();
    let later = open(&store, post("Later"), t0() + Duration::minutes(30));
    let sooner = open(&store, post("Sooner"), t0());
    let closed = open(&store, post("Closed"), t0());
    let withdraw = Changeset::on(&closed, ChangeCause::OwnerWithdrawal)
        .move_resource(&closed, ResourceState::Cancelled)
        .unwrap();
    store.commit(&withdraw, t0()).unwrap();

    let now = t0() + Duration::hours(2);
    let due = store.due_resources(now, 10).expect("due");
    assert_eq!(due, vec![sooner.id.clone(), later.id.clone()]);

    assert_eq!(store.due_resources(now, 1).unwrap(), vec![sooner.id]);
    assert!(store.due_resources(t0(), 10).unwrap().is_empty());
}

#[test]
fn purge_removes_only_old_terminal_resources() {
    let store = store();
    let old = open(&store, post("Old"), t0());
    claim(&store, &old, "alice");
    let keep = open(&store, post("Keep"), t0());

    let old_snapshot = store.snapshot(&old.id).unwrap();
    let expire = Changeset::on(&old_snapshot.resource, ChangeCause::Expiry)
        .move_resource(&old_snapshot.resource, ResourceState::Expired)
        .unwrap()
        .with_claim(
            ClaimChange::new(&old_snapshot.claims[0], ClaimState::Cancelled, ChangeCause::Expiry)
                .unwrap(),
        );
    store.commit(&expire, t0()).unwrap();

    assert_eq!(store.purge_retired(t0()).unwrap(), 0);
    assert_eq!(store.purge_retired(t0() + Duration::days(1)).unwrap(), 1);
    assert!(matches!(
        store.resource(&old.id),
        Err(StoreError::ResourceNotFound { .. })
    ));
    assert!(store.resource(&keep.id).is_ok());
}

// =============================================================================
// Listing
// =============================================================================

#[test]
fn listing_is_newest_first_and_excludes_overdue() {
    let store = Arc::new(store());
    let first = open(&store, post("First"), t0());
    let second = open(&store, post("Second"), t0() + Duration::minutes(1));
    let third = open(&store, ride(), t0() + Duration::minutes(2));

    let now = t0() + Duration::seconds(3630);
    let ids: Vec<_> = OpenResources::new(store.clone(), ListFilter::default(), now)
        .map(|r| r.expect("list").id)
        .collect();
    // `first` is overdue by now; `second` is not.
    assert_eq!(ids, vec![third.id.clone(), second.id.clone()]);
    assert!(!ids.contains(&first.id));
}

#[test]
fn listing_pages_and_resumes_from_cursor() {
    let store = Arc::new(store());
    let mut expected = Vec::new();
    for i in 0..5 {
        let r = open(&store, post(&format!("Item {i}")), t0() + Duration::seconds(i));
        expected.push(r.id);
    }
    expected.reverse();

    let filter = ListFilter {
        page_size: 2,
        ..ListFilter::default()
    };
    let mut listing = OpenResources::new(store.clone(), filter.clone(), t0());
    let head: Vec<_> = listing.by_ref().take(3).map(|r| r.unwrap().id).collect();
    assert_eq!(head, expected[..3]);

    let cursor = listing.cursor().cloned();
    let tail: Vec<_> = OpenResources::resume(store.clone(), filter, cursor, t0())
        .map(|r| r.unwrap().id)
        .collect();
    assert_eq!(tail, expected[3..]);
}

#[test]
fn listing_filters_by_kind_owner_and_query() {
    let store = Arc::new(store());
    let wallet = open(&store, post("Brown wallet"), t0());
    let umbrella = open(&store, post("Umbrella 50%_off"), t0());
    let trip = open(&store, ride(), t0());

    let rides: Vec<_> = OpenResources::new(store.clone(), ListFilter::of_kind(ResourceKind::Ride), t0())
        .map(|r| r.unwrap().id)
        .collect();
    assert_eq!(rides, vec![trip.id.clone()]);

    let query = |q: &str| -> Vec<ResourceId> {
        let filter = ListFilter {
            query: Some(q.into()),
            ..ListFilter::default()
        };
        OpenResources::new(store.clone(), filter, t0())
            .map(|r| r.unwrap().id)
            .collect()
    };
    assert_eq!(query("WALLET"), vec![wallet.id.clone()]);
    assert_eq!(query("50%_"), vec![umbrella.id.clone()]);
    assert_eq!(query("old town"), vec![trip.id.clone()]);
    assert_eq!(query("   ").len(), 3);

    let nobody = ListFilter {
        owner: Some(Identity::new("someone-else")),
        ..ListFilter::default()
    };
    assert_eq!(OpenResources::new(store.clone(), nobody, t0()).count(), 0);
}

#[test]
fn listing_filters_lost_found_by_item_status() {
    let store = Arc::new(store());
    let lost = open(&store, post("Brown wallet"), t0());
    let found = open(
        &store,
        ResourcePayload::LostFound(LostFoundPost {
            title: "Keys on a red lanyard".into(),
            description: "three keys".into(),
            location: "Canteen".into(),
            status: ItemStatus::Found,
            contact: "finder@campus.example".into(),
        }),
        t0(),
    );
    open(&store, ride(), t0());

    let by_status = |status: ItemStatus| -> Vec<ResourceId> {
        let filter = ListFilter {
            item_status: Some(status),
            ..ListFilter::default()
        };
        OpenResources::new(store.clone(), filter, t0())
            .map(|r| r.unwrap().id)
            .collect()
    };
    assert_eq!(by_status(ItemStatus::Lost), vec![lost.id.clone()]);
    assert_eq!(by_status(ItemStatus::Found), vec![found.id.clone()]);
}

#[test]
fn pending_claims_are_listed_per_owner_across_resources() {
    let store = store();
    let first = open(&store, post("Scarf"), t0());
    let second = open(&store, post("Gloves"), t0() + Duration::minutes(1));
    let foreign = Resource::open(
        Identity::new("someone-else"),
        post("Hat"),
        Some(t0() + Duration::hours(1)),
        t0(),
    );
    store.insert_resource(&foreign).unwrap();

    let alice = claim(&store, &first, "alice");
    let late = Claim::pending(
        second.id.clone(),
        Identity::new("bob"),
        ClaimPayload::ItemClaim {
            message: "those are mine".into(),
        },
        t0() + Duration::minutes(5),
    );
    store.insert_claim(&late).unwrap();
    claim(&store, &foreign, "carol");

    let ids: Vec<ClaimId> = store
        .pending_claims_for_owner(&Identity::new("owner"))
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![alice.id.clone(), late.id.clone()]);

    // Decided claims leave the inbox.
    let snapshot = store.snapshot(&second.id).unwrap();
    let changeset = Changeset::on(&snapshot.resource, ChangeCause::OwnerDecision).with_claim(
        ClaimChange::new(&late, ClaimState::Rejected, ChangeCause::OwnerDecision).unwrap(),
    );
    store
        .commit(&changeset, t0() + Duration::minutes(6))
        .unwrap();

    let remaining = store
        .pending_claims_for_owner(&Identity::new("owner"))
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, alice.id);
    assert!(store
        .pending_claims_for_owner(&Identity::new("nobody"))
        .unwrap()
        .is_empty());
}
