//! Client calls against a real detiler API served on loopback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use detiler_client::{
    CancelHandle, CancelToken, ClientConfig, ClientError, DetilerClient, RetryStrategy,
};
use detiler_core::{
    CooldownCreationRequest, CooldownQuery, KitMetadata, Outcome, TileDetailsPayload, TileKey,
    TileParams, TileQuery, UpsertStatus,
};
use detiler_state::DetilerStore;

async fn serve() -> DetilerClient {
    let store = DetilerStore::open_in_memory().unwrap();
    let router = detiler_api::build_router(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    DetilerClient::new(&ClientConfig::new(format!("http://{addr}"))).unwrap()
}

async fn seed_tiles(client: &DetilerClient, kit: &str, count: u32) {
    for x in 0..count {
        let status = client
            .set_tile_details(&TileKey::new(kit, 5, x, 1), &TileDetailsPayload::new(1000))
            .await
            .unwrap();
        assert_eq!(status, UpsertStatus::Inserted);
    }
}

fn tile_query(kit: &str, size: Option<usize>) -> TileQuery {
    TileQuery {
        min_zoom: 5,
        max_zoom: 5,
        kits: vec![kit.to_string()],
        size,
        ..Default::default()
    }
}

#[tokio::test]
async fn kits_and_tile_details() {
    let client = serve().await;
    client.liveness().await.unwrap();

    let kit = KitMetadata::new("osm").with_attribute("style", "bright");
    let created = client.create_kit(&kit).await.unwrap();
    assert_eq!(created.name, "osm");
    assert!(matches!(
        client.create_kit(&kit).await,
        Err(ClientError::Status { status: 409, .. })
    ));

    let kits = client.get_kits().await.unwrap();
    assert_eq!(kits.len(), 1);
    assert_eq!(kits[0].attributes["style"], "bright");

    let key = TileKey::new("osm", 5, 1, 1);
    assert!(client.get_tile_details(&key).await.unwrap().is_none());

    let first = client
        .set_tile_details(&key, &TileDetailsPayload::new(1000))
        .await
        .unwrap();
    assert_eq!(first, UpsertStatus::Inserted);
    let payload = TileDetailsPayload::new(2000)
        .with_state(4)
        .with_outcome(Outcome::Rendered);
    let second = client.set_tile_details(&key, &payload).await.unwrap();
    assert_eq!(second, UpsertStatus::Updated);

    let record = client.get_tile_details(&key).await.unwrap().unwrap();
    assert_eq!(record.states, vec![-1, 4]);
    assert_eq!(record.render_count, 1);
    assert_eq!(record.updated_at, 2000);
    assert_eq!(record.rendered_at, 2000);

    let across = client
        .get_tiles_details(TileParams { z: 5, x: 1, y: 1 }, &[])
        .await
        .unwrap();
    assert_eq!(across.len(), 1);
}

#[tokio::test]
async fn error_statuses_are_surfaced() {
    let client = serve().await;

    let unknown_kit = client
        .set_tile_details(&TileKey::new("ghost", 1, 0, 0), &TileDetailsPayload::new(1))
        .await;
    assert!(matches!(unknown_kit, Err(ClientError::Status { status: 404, .. })));

    let inverted = TileQuery {
        min_zoom: 5,
        max_zoom: 2,
        kits: vec!["osm".to_string()],
        ..Default::default()
    };
    match client.query_tiles(&inverted).await {
        Err(ClientError::Status { status, message }) => {
            assert_eq!(status, 400);
            assert!(!message.is_empty());
        }
        other => panic!("expected 400, got {other:?}"),
    }
}

#[tokio::test]
async fn tile_pager_walks_every_page() {
    let client = serve().await;
    client.create_kit(&KitMetadata::new("osm")).await.unwrap();
    seed_tiles(&client, "osm", 5).await;

    let mut pager = client.tile_pager(tile_query("osm", Some(2)), CancelToken::never());
    let mut sizes = Vec::new();
    while let Some(page) = pager.next_page().await {
        sizes.push(page.unwrap().len());
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(pager.next_page().await.is_none());

    let all = client
        .tile_pager(tile_query("osm", None), CancelToken::never())
        .collect_all()
        .await
        .unwrap();
    let mut xs: Vec<u32> = all.iter().map(|t| t.x).collect();
    xs.sort();
    assert_eq!(xs, vec![0, 1, 2, 3, 4]);

    let none = client
        .tile_pager(tile_query("other", Some(2)), CancelToken::never())
        .collect_all()
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn cancelled_pager_stops_before_fetching() {
    let client = serve().await;
    client.create_kit(&KitMetadata::new("osm")).await.unwrap();
    seed_tiles(&client, "osm", 4).await;

    let handle = CancelHandle::new();
    let mut pager = client.tile_pager(tile_query("osm", Some(2)), handle.token());
    assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 2);

    handle.cancel();
    assert!(matches!(
        pager.next_page().await,
        Some(Err(ClientError::Cancelled))
    ));
    assert!(pager.next_page().await.is_none());
}

#[tokio::test]
async fn cancel_interrupts_an_in_flight_page() {
    // Accepts connections and never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = ClientConfig::new(format!("http://{addr}")).with_timeout(Duration::from_secs(30));
    let client = DetilerClient::new(&config).unwrap();
    let handle = CancelHandle::new();
    let mut pager = client.tile_pager(tile_query("osm", None), handle.token());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });
    let page = tokio::time::timeout(Duration::from_secs(5), pager.next_page())
        .await
        .expect("cancellation should end the fetch");
    assert!(matches!(page, Some(Err(ClientError::Cancelled))));
}

#[tokio::test]
async fn upstream_failures_are_retried() {
    // Accepts and immediately drops every connection.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let config = ClientConfig::new(format!("http://{addr}"))
        .with_timeout(Duration::from_secs(5))
        .with_retry(RetryStrategy {
            retries: 2,
            is_exponential: true,
            delay_ms: 10,
        });
    let client = DetilerClient::new(&config).unwrap();

    assert!(matches!(client.get_kits().await, Err(ClientError::Upstream(_))));
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn timeout_is_an_upstream_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config =
        ClientConfig::new(format!("http://{addr}")).with_timeout(Duration::from_millis(100));
    let client = DetilerClient::new(&config).unwrap();
    assert!(matches!(client.liveness().await, Err(ClientError::Upstream(_))));
}

#[tokio::test]
async fn cooldowns_roundtrip_and_page() {
    let client = serve().await;

    let request = |max_zoom| CooldownCreationRequest {
        kits: vec!["osm".to_string()],
        min_zoom: 0,
        max_zoom,
        enabled: true,
        duration: 60,
        ttl: None,
        description: Some("maintenance".to_string()),
        area: None,
    };
    let key = client.create_cooldown(&request(5)).await.unwrap();
    assert!(key.starts_with("cooldown:"));
    assert_eq!(client.create_cooldown(&request(5)).await.unwrap(), key);
    client.create_cooldown(&request(6)).await.unwrap();
    client.create_cooldown(&request(7)).await.unwrap();

    let query = CooldownQuery {
        kits: vec!["osm".to_string()],
        size: Some(2),
        ..Default::default()
    };
    let mut pager = client.cooldown_pager(query.clone(), CancelToken::never());
    assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 2);
    assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 1);
    assert!(pager.next_page().await.is_none());

    let all = client
        .cooldown_pager(
            CooldownQuery {
                size: None,
                ..query
            },
            CancelToken::never(),
        )
        .collect_all()
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|c| c.description.as_deref() == Some("maintenance")));

    let disabled = client
        .query_cooldowns(&CooldownQuery {
            enabled: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(disabled.is_empty());
}
