//! Offer expiry reaper behavior.

use std::sync::Arc;
use std::time::Duration;

use ridecore::testing::CountingObserver;
use ridecore::{
    AcceptOffer, CommandContext, CreateOffer, CreateRide, GeoPoint, LifecycleEngine,
    LifecycleStore, NoopObserver, OfferExpiryReaper, OfferId, OutboxStatus, ReaperConfig, RideId,
    RiderId, StartMatching, Timestamp,
};
use ridecore_memory::InMemoryLifecycleStore;

struct Fixture {
    store: Arc<InMemoryLifecycleStore>,
    engine: Arc<LifecycleEngine<InMemoryLifecycleStore>>,
    ride_id: RideId,
}

async fn offered_ride() -> Fixture {
    let store = Arc::new(InMemoryLifecycleStore::new());
    let engine = Arc::new(LifecycleEngine::new(Arc::clone(&store)));
    let created = engine
        .create_ride(
            CreateRide {
                rider_id: RiderId::new(),
                pickup: GeoPoint::try_new(35.6762, 139.6503).unwrap(),
                dropoff: GeoPoint::try_new(35.68, 139.64).unwrap(),
            },
            CommandContext::default(),
        )
        .await
        .unwrap();
    let ride_id = RideId::try_new(created.aggregate_id).unwrap();
    engine
        .start_matching(StartMatching { ride_id }, CommandContext::default())
        .await
        .unwrap();
    Fixture {
        store,
        engine,
        ride_id,
    }
}

async fn open_offer(fixture: &Fixture, ttl_seconds: i64) -> OfferId {
    let receipt = fixture
        .engine
        .create_offer(
            CreateOffer {
                ride_id: fixture.ride_id,
                driver_id: ridecore::DriverId::new(),
                ttl: chrono::Duration::seconds(ttl_seconds),
            },
            CommandContext::default(),
        )
        .await
        .unwrap();
    OfferId::try_new(receipt.aggregate_id).unwrap()
}

fn reaper(fixture: &Fixture) -> OfferExpiryReaper<InMemoryLifecycleStore> {
    OfferExpiryReaper::new(
        Arc::clone(&fixture.engine),
        Arc::clone(&fixture.store),
        ReaperConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 50,
        },
        Arc::new(NoopObserver),
    )
}

#[tokio::test]
async fn overdue_pending_offers_are_expired_with_one_event_each() {
    let fixture = offered_ride().await;
    let offer_id = open_offer(&fixture, 5).await;
    let reaper = reaper(&fixture);

    let now = Timestamp::now();
    // Not yet due: the sweep is a no-op.
    assert_eq!(reaper.sweep_at(now).await.unwrap(), 0);

    let rows_before = fixture
        .store
        .count_outbox(OutboxStatus::Pending)
        .await
        .unwrap();
    let later = now.advanced_by(chrono::Duration::seconds(6));
    assert_eq!(reaper.sweep_at(later).await.unwrap(), 1);

    let offer = fixture.store.fetch_offer(offer_id).await.unwrap();
    assert_eq!(offer.status.as_str(), "EXPIRED");
    assert_eq!(
        fixture
            .store
            .count_outbox(OutboxStatus::Pending)
            .await
            .unwrap(),
        rows_before + 1
    );

    // A second sweep finds nothing left to do.
    assert_eq!(reaper.sweep_at(later).await.unwrap(), 0);
}

#[tokio::test]
async fn settled_offers_are_not_touched_by_the_sweep() {
    let fixture = offered_ride().await;
    let expiring = open_offer(&fixture, 5).await;
    let accepted = open_offer(&fixture, 5).await;

    fixture
        .engine
        .accept_offer(
            AcceptOffer {
                offer_id: accepted,
            },
            CommandContext::default(),
        )
        .await
        .unwrap();

    let reaper = reaper(&fixture);
    let later = Timestamp::now().advanced_by(chrono::Duration::seconds(6));
    assert_eq!(reaper.sweep_at(later).await.unwrap(), 1);

    assert_eq!(
        fixture
            .store
            .fetch_offer(expiring)
            .await
            .unwrap()
            .status
            .as_str(),
        "EXPIRED"
    );
    assert_eq!(
        fixture
            .store
            .fetch_offer(accepted)
            .await
            .unwrap()
            .status
            .as_str(),
        "ACCEPTED"
    );
}

#[tokio::test]
async fn sweep_outcomes_reach_the_observer() {
    let fixture = offered_ride().await;
    open_offer(&fixture, 5).await;

    let observer = Arc::new(CountingObserver::new());
    let reaper = OfferExpiryReaper::new(
        Arc::clone(&fixture.engine),
        Arc::clone(&fixture.store),
        ReaperConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 50,
        },
        Arc::clone(&observer) as Arc<dyn ridecore::LifecycleObserver>,
    );

    let later = Timestamp::now().advanced_by(chrono::Duration::seconds(6));
    reaper.sweep_at(later).await.unwrap();
    assert_eq!(
        observer
            .expired
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn background_loop_expires_offers_until_stopped() {
    let fixture = offered_ride().await;
    // A ttl of one second is generous against a 10ms poll loop only after
    // the second has elapsed, so park until the offer is safely overdue.
    let offer_id = open_offer(&fixture, 1).await;

    let reaper = reaper(&fixture);
    reaper.start().await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    reaper.stop().await;

    let offer = fixture.store.fetch_offer(offer_id).await.unwrap();
    assert_eq!(offer.status.as_str(), "EXPIRED");
}
