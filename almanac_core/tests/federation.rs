mod common;

use almanac_core::config::ValidationConfig;
use almanac_core::federation;
use almanac_core::ingest::IngestOptions;
use serde_json::{json, Value};

use common::{ctx, jazz_night, Harness};

fn peer_event(name: &str) -> Value {
    json!({
        "@context": ["https://schema.org", {"peer": "https://peer.example/ns#"}],
        "@id": "https://peer.example/events/E1",
        "@type": "MusicEvent",
        "name": name,
        "startDate": "2026-07-10T19:00:00-04:00",
        "location": {
            "@type": "Place",
            "name": "The Rex",
            "address": {
                "@type": "PostalAddress",
                "streetAddress": "194 Queen St W",
                "addressLocality": "Toronto",
                "addressCountry": "CA"
            }
        },
        "organizer": {
            "@type": "Organization",
            "@id": "https://peer.example/organizations/O1",
            "name": "Rex Presents",
            "url": "https://www.rex.example"
        },
        "peer:featured": true
    })
}

#[tokio::test]
async fn round_trip_does_not_duplicate_entities() {
    let (h, mem) = Harness::memory(ValidationConfig::default());
    h.register_peer("peer.example").await;

    let first = h
        .sync
        .sync_event(&ctx(), &peer_event("Jazz Night"), None)
        .await
        .unwrap();
    let second = h
        .sync
        .sync_event(&ctx(), &peer_event("Jazz Night"), None)
        .await
        .unwrap();

    assert!(first.is_new);
    assert!(!second.is_new);
    assert_eq!(first.event_id, second.event_id);
    assert_eq!(mem.all_events().await.len(), 1);
    assert_eq!(mem.all_places().await.len(), 1);
    assert_eq!(mem.all_organizations().await.len(), 1);

    let event = mem.all_events().await.remove(0);
    assert_eq!(event.extensions.get("peer:featured"), Some(&json!(true)));
    assert_eq!(
        event.starts_at().map(|s| s.to_rfc3339()),
        Some("2026-07-10T23:00:00+00:00".to_string())
    );
}

#[tokio::test]
async fn synced_and_ingested_events_share_the_venue() {
    let (h, mem) = Harness::memory(ValidationConfig::default());
    h.register_peer("peer.example").await;
    h.sync
        .sync_event(&ctx(), &peer_event("Jazz Night"), None)
        .await
        .unwrap();

    // Different show, same venue by name and address.
    let direct = almanac_core::candidate::CandidateEvent {
        name: "Blues Brunch".into(),
        start_date: "2026-07-12T15:00:00Z".into(),
        ..jazz_night()
    };
    h.ingest
        .ingest(&ctx(), &direct, IngestOptions::default())
        .await
        .unwrap();

    assert_eq!(mem.all_events().await.len(), 2);
    assert_eq!(mem.all_places().await.len(), 1);
}

#[tokio::test]
async fn malformed_payloads_name_the_problem() {
    let (h, mem) = Harness::memory(ValidationConfig::default());
    h.register_peer("peer.example").await;

    let mut no_type = peer_event("Jazz Night");
    no_type.as_object_mut().unwrap().remove("@type");
    let mut bad_date = peer_event("Jazz Night");
    bad_date["startDate"] = json!("next friday");
    let mut no_name = peer_event("Jazz Night");
    no_name.as_object_mut().unwrap().remove("name");

    assert!(matches!(
        h.sync.sync_event(&ctx(), &json!({}), None).await,
        Err(federation::Error::InvalidPayload(_))
    ));
    assert!(matches!(
        h.sync.sync_event(&ctx(), &no_type, None).await,
        Err(federation::Error::MissingType)
    ));
    assert!(matches!(
        h.sync.sync_event(&ctx(), &bad_date, None).await,
        Err(federation::Error::InvalidDateFormat(ref f)) if f == "startDate"
    ));
    assert!(matches!(
        h.sync.sync_event(&ctx(), &no_name, None).await,
        Err(federation::Error::MissingRequiredField(ref f)) if f == "name"
    ));
    assert!(mem.all_events().await.is_empty());
}

#[tokio::test]
async fn refused_sync_leaves_token_unclaimed() {
    let (h, mem) = Harness::memory(ValidationConfig::default());
    h.register_peer("peer.example").await;
    h.sync
        .nodes()
        .set_sync_enabled(&ctx(), "peer.example", false)
        .await
        .unwrap();

    let err = h
        .sync
        .sync_event(&ctx(), &peer_event("Jazz Night"), Some("k1"))
        .await
        .unwrap_err();
    assert!(matches!(err, federation::Error::NodeSyncDisabled(_)));

    h.sync
        .nodes()
        .set_sync_enabled(&ctx(), "peer.example", true)
        .await
        .unwrap();
    let res = h
        .sync
        .sync_event(&ctx(), &peer_event("Jazz Night"), Some("k1"))
        .await
        .unwrap();
    assert!(res.is_new && !res.replayed);
    assert_eq!(mem.all_events().await.len(), 1);
}
