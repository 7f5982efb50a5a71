//! HTTP API integration tests
//!
//! Runs a full instance on an ephemeral port and drives it with reqwest.

mod common;

use common::TestEnv;
use kura::search::SearchResponse;

#[tokio::test]
async fn test_push_then_get_trace() {
    let env = TestEnv::new().await;

    let status = env
        .push(None, "4bf92f3577b34da6a3ce929d0e0e4736", "start=100&end=120", b"spans")
        .await;
    assert_eq!(status, 204);

    let (status, body) = env.get_trace(None, "4bf92f3577b34da6a3ce929d0e0e4736").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"spans");

    let (status, _) = env.get_trace(None, "deadbeef").await;
    assert_eq!(status, 404);

    env.shutdown().await;
}

#[tokio::test]
async fn test_trace_survives_flush() {
    let env = TestEnv::new().await;
    assert_eq!(env.push(None, "0a", "", b"before flush").await, 204);

    env.app.ingester().sweep(true).await;
    assert_eq!(env.app.store().blocklist("single-tenant").len(), 1);

    let (status, body) = env.get_trace(None, "0a").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"before flush");

    let blocks: serde_json::Value = env
        .client
        .get(env.url("/api/blocks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(blocks.as_array().map(Vec::len), Some(1));
    assert_eq!(blocks[0]["tenantID"], "single-tenant");
    assert_eq!(blocks[0]["totalObjects"], 1);

    env.shutdown().await;
}

#[tokio::test]
async fn test_larger_duplicate_wins() {
    let env = TestEnv::new().await;
    env.push(None, "77", "", b"short").await;
    env.app.ingester().sweep(true).await;
    env.push(None, "77", "", b"much longer version").await;

    let (_, body) = env.get_trace(None, "77").await;
    assert_eq!(body, b"much longer version");

    env.shutdown().await;
}

#[tokio::test]
async fn test_tenant_isolation() {
    let env = TestEnv::new().await;
    assert_eq!(env.push(Some("team-a"), "01", "", b"a").await, 204);

    assert_eq!(env.get_trace(Some("team-a"), "01").await.0, 200);
    assert_eq!(env.get_trace(Some("team-b"), "01").await.0, 404);
    assert_eq!(env.get_trace(None, "01").await.0, 404);
    assert_eq!(env.get_trace(Some("a/b"), "01").await.0, 400);

    env.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests() {
    let env = TestEnv::with_yaml("ingester:\n  max_bytes_per_trace: 16\n").await;

    assert_eq!(env.push(None, "not-hex", "", b"x").await, 400);
    assert_eq!(env.push(None, "01", "end=later", b"x").await, 400);
    assert_eq!(env.push(None, "01", "", &[0u8; 64]).await, 413);
    assert_eq!(env.get_trace(None, "00112233445566778899aabbccddeeff00").await.0, 400);

    let response = env.client.put(env.url("/api/push/01")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 405);

    env.shutdown().await;
}

#[tokio::test]
async fn test_oversized_body_rejected_without_storing() {
    let env = TestEnv::with_yaml("ingester:\n  max_bytes_per_trace: 16\n").await;

    assert_eq!(env.push(None, "0b", "", &[7u8; 4096]).await, 413);
    assert_eq!(env.get_trace(None, "0b").await.0, 404);

    assert_eq!(env.push(None, "0b", "", &[7u8; 16]).await, 204);
    let (status, body) = env.get_trace(None, "0b").await;
    assert_eq!(status, 200);
    assert_eq!(body, vec![7u8; 16]);

    env.shutdown().await;
}

#[tokio::test]
async fn test_search_live_blocks() {
    let env = TestEnv::new().await;
    env.push(None, "a1", "start=100&end=110&service.name=checkout&http.status_code=500", b"1")
        .await;
    env.push(None, "a2", "start=200&end=210&service.name=checkout&http.status_code=200", b"2")
        .await;
    env.push(None, "a3", "start=300&end=310&service.name=cart", b"3").await;

    let search = |query: &'static str| {
        let client = env.client.clone();
        let url = env.url(&format!("/api/search?{}", query));
        async move {
            client
                .get(url)
                .send()
                .await
                .unwrap()
                .json::<SearchResponse>()
                .await
                .unwrap()
        }
    };

    let response = search("service.name=checkout").await;
    let mut ids: Vec<_> = response.traces.iter().map(|t| t.trace_id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a1", "a2"]);

    let response = search("service.name=checkout&http.status_code=500").await;
    assert_eq!(response.traces.len(), 1);
    assert_eq!(response.traces[0].start_time_unix_seconds, 100);

    let response = search("service.name=checkout&limit=1").await;
    assert_eq!(response.traces.len(), 1);

    let response = search("start=250").await;
    assert_eq!(response.traces.len(), 1);
    assert_eq!(response.traces[0].trace_id, "a3");

    env.shutdown().await;
}

#[tokio::test]
async fn test_operational_endpoints() {
    let env = TestEnv::new().await;

    let health: serde_json::Value = env
        .client
        .get(env.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let ready = env.client.get(env.url("/ready")).send().await.unwrap();
    assert!(ready.status().is_success());

    env.push(None, "01", "", b"x").await;
    let metrics = env.client.get(env.url("/metrics")).send().await.unwrap();
    assert!(metrics
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/plain")));
    let text = metrics.text().await.unwrap();
    assert!(text.contains("kura_http_requests_total"));
    assert!(text.contains("kura_ingester_traces_pushed_total"));

    env.shutdown().await;
}

#[tokio::test]
async fn test_metrics_can_be_disabled() {
    let env = TestEnv::with_yaml("metrics:\n  enabled: false\n").await;
    let response = env.client.get(env.url("/metrics")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    env.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_pushes() {
    use rand::Rng;

    let env = TestEnv::new().await;
    let mut rng = rand::rng();
    let traces: Vec<(String, Vec<u8>)> = (0..50u32)
        .map(|i| {
            let len = rng.random_range(1..4096);
            (format!("{:08x}", i + 1), vec![(i % 251) as u8; len])
        })
        .collect();

    let handles: Vec<_> = traces
        .iter()
        .cloned()
        .map(|(id, body)| {
            let client = env.client.clone();
            let url = env.url(&format!("/api/push/{}", id));
            tokio::spawn(async move { client.post(url).body(body).send().await })
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        assert_eq!(result.unwrap().unwrap().status().as_u16(), 204);
    }

    env.app.ingester().sweep(true).await;
    for (id, body) in &traces {
        let (status, found) = env.get_trace(None, id).await;
        assert_eq!(status, 200, "trace {}", id);
        assert_eq!(&found, body);
    }

    env.shutdown().await;
}
