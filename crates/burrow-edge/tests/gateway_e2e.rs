//! End-to-end scenarios: a live gateway on an ephemeral port, a mock
//! Control Plane, tokio-tungstenite agents on the south side and reqwest
//! on the north side.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::*;

#[tokio::test]
async fn happy_path_roundtrip() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    spawn_echo_agent(socket);

    let response = reqwest::get(format!("{}/local_tunnel/my-slug/hi", gateway.base))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(response.headers()["x-agent"], "echo");
    assert_eq!(response.text().await.unwrap(), "echo:GET /hi");
    assert_eq!(gateway.state.tunnels.pending_count(), 0);

    // ownership and slug cache both landed in the shared store
    assert_eq!(
        gateway
            .state
            .registry
            .owner_of(TEST_TUNNEL)
            .await
            .unwrap()
            .as_deref(),
        Some("pod-test")
    );
    assert_eq!(
        gateway
            .state
            .registry
            .cached_slug("my-slug")
            .await
            .unwrap()
            .as_deref(),
        Some(TEST_TUNNEL)
    );
}

#[tokio::test]
async fn forwarder_never_propagates_framing_headers() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    spawn_echo_agent(socket);

    let response = reqwest::get(format!("{}/local_tunnel/my-slug/hi", gateway.base))
        .await
        .unwrap();

    // the agent lied with Content-Length: 9999; the outer layer reframes
    let length: usize = response.headers()["content-length"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(length, "echo:GET /hi".len());
    assert!(response.headers().get("transfer-encoding").is_none());
}

#[tokio::test]
async fn concurrent_requests_correlate_to_their_own_replies() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    spawn_echo_agent(socket);

    let one = reqwest::get(format!("{}/local_tunnel/my-slug/one", gateway.base));
    let two = reqwest::get(format!("{}/local_tunnel/my-slug/two", gateway.base));
    let (one, two) = tokio::join!(one, two);

    assert_eq!(one.unwrap().text().await.unwrap(), "echo:GET /one");
    assert_eq!(two.unwrap().text().await.unwrap(), "echo:GET /two");
    assert_eq!(gateway.state.tunnels.pending_count(), 0);
}

#[tokio::test]
async fn post_bodies_reach_the_agent_path() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    spawn_echo_agent(socket);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/local_tunnel/my-slug/submit", gateway.base))
        .body("hello")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "echo:POST /submit");
}

#[tokio::test]
async fn unknown_slug_is_404() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let response = reqwest::get(format!("{}/local_tunnel/nope/x", gateway.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "Slug not found");
}

#[tokio::test]
async fn expired_tunnel_is_410() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let response = reqwest::get(format!("{}/local_tunnel/expired-slug/x", gateway.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 410);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "Tunnel expired");
}

#[tokio::test]
async fn control_plane_failure_is_502_not_404() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let response = reqwest::get(format!("{}/local_tunnel/broken-slug/x", gateway.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn tunnel_on_no_pod_is_503() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    // my-slug resolves, but no agent ever connected here
    let response = reqwest::get(format!("{}/local_tunnel/my-slug/x", gateway.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "Tunnel not connected to this pod");
}

#[tokio::test]
async fn oversized_request_is_413_and_never_sent() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    let seen = Arc::new(AtomicUsize::new(0));
    spawn_silent_agent(socket, seen.clone());

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/local_tunnel/my-slug/upload", gateway.base))
        .body("x".repeat(70 * 1024))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    assert_eq!(gateway.state.tunnels.pending_count(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stalled_agent_is_504_and_pending_is_reaped() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |config| {
        config.tunnel.request_timeout_seconds = 1;
    })
    .await;

    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    let seen = Arc::new(AtomicUsize::new(0));
    spawn_silent_agent(socket, seen.clone());

    let response = reqwest::get(format!("{}/local_tunnel/my-slug/slow", gateway.base))
        .await
        .unwrap();

    assert_eq!(response.status(), 504);
    assert_eq!(gateway.state.tunnels.pending_count(), 0);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_token_closes_1008() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let mut socket = connect_agent(&gateway, TEST_TUNNEL, None).await;
    let (code, reason) = expect_close(&mut socket).await;
    assert_eq!(code, 1008);
    assert!(reason.contains("X-Tunnel-Token"), "reason: {reason}");
    assert_eq!(gateway.state.tunnels.active_count(), 0);
}

#[tokio::test]
async fn invalid_token_closes_1008_with_status() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let mut socket = connect_agent(&gateway, TEST_TUNNEL, Some("wrong_token")).await;
    let (code, reason) = expect_close(&mut socket).await;
    assert_eq!(code, 1008);
    assert!(reason.contains("unauthorized"), "reason: {reason}");

    // nothing landed in local or shared state
    assert_eq!(gateway.state.tunnels.active_count(), 0);
    assert_eq!(
        gateway.state.registry.owner_of(TEST_TUNNEL).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn revoked_tunnel_closes_1008() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let mut socket = connect_agent(&gateway, "tunnel_revoked", Some("revoked_token")).await;
    let (code, reason) = expect_close(&mut socket).await;
    assert_eq!(code, 1008);
    assert!(reason.contains("revoked"), "reason: {reason}");
}

#[tokio::test]
async fn unreachable_control_plane_closes_1011() {
    // nothing listens here; validation cannot happen
    let gateway = spawn_gateway("http://127.0.0.1:1", |_| {}).await;

    let mut socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    let (code, _reason) = expect_close(&mut socket).await;
    assert_eq!(code, 1011);
}

#[tokio::test]
async fn duplicate_registration_closes_1008_and_keeps_the_first() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let first = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    spawn_echo_agent(first);

    let mut second = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    let (code, reason) = expect_close(&mut second).await;
    assert_eq!(code, 1008);
    assert!(reason.contains("already registered"), "reason: {reason}");

    // the original session is unaffected
    assert_eq!(gateway.state.tunnels.active_count(), 1);
    let response = reqwest::get(format!("{}/local_tunnel/my-slug/still-up", gateway.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn oversized_agent_frame_closes_1009() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |config| {
        config.tunnel.max_ws_payload_bytes = 1024;
    })
    .await;

    let mut socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;

    use futures::SinkExt;
    use tokio_tungstenite::tungstenite::Message;
    socket
        .send(Message::Text(format!(r#"{{"type":"pong","pad":"{}"}}"#, "x".repeat(2048)).into()))
        .await
        .unwrap();

    let (code, _reason) = expect_close(&mut socket).await;
    assert_eq!(code, 1009);

    // the session is unregistered everywhere afterwards
    for _ in 0..100 {
        if gateway.state.tunnels.active_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gateway.state.tunnels.active_count(), 0);
    assert_eq!(
        gateway.state.registry.owner_of(TEST_TUNNEL).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn malformed_frames_are_skipped_not_fatal() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let mut socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;

    use futures::SinkExt;
    use tokio_tungstenite::tungstenite::Message;
    socket
        .send(Message::Text("this is not json".to_string().into()))
        .await
        .unwrap();
    socket
        .send(Message::Text(r#"{"type":"weird-new-frame"}"#.to_string().into()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.state.tunnels.active_count(), 1);
}

#[tokio::test]
async fn agent_ping_gets_a_pong() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let mut socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;

    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;
    socket
        .send(Message::Text(r#"{"type":"ping"}"#.to_string().into()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match reply {
        Message::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(value["type"], "pong");
        }
        other => panic!("expected a pong frame, got {other:?}"),
    }
}

#[tokio::test]
async fn static_assets_route_through_the_referring_tunnel() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    spawn_echo_agent(socket);

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/static/css/app.css", gateway.base))
        .header(
            "Referer",
            format!("{}/local_tunnel/my-slug/docs", gateway.base),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "echo:GET /static/css/app.css");
}

#[tokio::test]
async fn static_without_referer_is_400_and_unmatched_is_404() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/static/app.js", gateway.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .get(format!("{}/static/app.js", gateway.base))
        .header("Referer", format!("{}/somewhere/else", gateway.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn health_probes_answer_200() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let live: serde_json::Value = reqwest::get(format!("{}/health/live", gateway.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(live["status"], "alive");

    let ready: serde_json::Value = reqwest::get(format!("{}/health/ready", gateway.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ready["status"], "ready");
}

#[tokio::test]
async fn agent_disconnect_unregisters_everywhere() {
    let cp = spawn_mock_control_plane().await;
    let gateway = spawn_gateway(&cp, |_| {}).await;

    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    drop(socket);

    for _ in 0..200 {
        if gateway.state.tunnels.active_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gateway.state.tunnels.active_count(), 0);
    assert_eq!(
        gateway.state.registry.owner_of(TEST_TUNNEL).await.unwrap(),
        None
    );

    // and the slot is free for a reconnect
    let socket = connect_agent(&gateway, TEST_TUNNEL, Some(VALID_TOKEN)).await;
    wait_for_tunnel(&gateway, TEST_TUNNEL).await;
    drop(socket);
}
