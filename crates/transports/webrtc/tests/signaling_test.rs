//! Signaling end-to-end tests over a localhost WebSocket
//!
//! These exercise the server/client pair directly; no peer connection is
//! created, so ICE and DTLS stay out of the picture.

use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use wrb_webrtc::signaling::{client, ConfigureMessage, SignalingEvent, SignalingServer};

const STEP: Duration = Duration::from_secs(5);

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .try_init();
}

async fn bind() -> (SignalingServer, String) {
    let server = SignalingServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().to_string();
    (server, addr)
}

fn description(kind: &str) -> RTCSessionDescription {
    serde_json::from_value(json!({"type": kind, "sdp": "v=0\r\n"})).unwrap()
}

fn candidate() -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

async fn wait_for_free_slot(server: &SignalingServer) {
    timeout(STEP, async {
        while server.has_receiver() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("receiver slot was never released");
}

#[tokio::test]
async fn test_configure_reaches_server() {
    init_test_tracing();
    let (mut server, addr) = bind().await;

    let _client = client::connect(&addr, ConfigureMessage::new("s1", "/camera/image_raw"))
        .await
        .unwrap();
    let mut session = timeout(STEP, server.next_session()).await.unwrap().unwrap();
    assert!(session.peer_addr().is_some());
    assert!(server.has_receiver());

    match timeout(STEP, session.next_event()).await.unwrap() {
        Some(SignalingEvent::Configure(setup)) => {
            assert_eq!(setup.stream_id, "s1");
            assert_eq!(setup.track_id, "s1/subscribed_video");
            assert_eq!(setup.src, "ros_image:/camera/image_raw");
        }
        other => panic!("expected configure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_offer_answer_and_candidates() {
    init_test_tracing();
    let (mut server, addr) = bind().await;

    let mut client = client::connect(&addr, ConfigureMessage::new("s1", "image_raw"))
        .await
        .unwrap();
    let mut session = timeout(STEP, server.next_session()).await.unwrap().unwrap();
    assert!(matches!(
        timeout(STEP, session.next_event()).await.unwrap(),
        Some(SignalingEvent::Configure(_))
    ));

    session.send_description(description("offer")).unwrap();
    match timeout(STEP, client.next_event()).await.unwrap() {
        Some(SignalingEvent::Description(desc)) => assert_eq!(desc.sdp, "v=0\r\n"),
        other => panic!("expected offer, got {:?}", other),
    }

    client.send_description(description("answer")).unwrap();
    client.send_candidate(candidate()).unwrap();
    assert!(matches!(
        timeout(STEP, session.next_event()).await.unwrap(),
        Some(SignalingEvent::Description(_))
    ));
    match timeout(STEP, session.next_event()).await.unwrap() {
        Some(SignalingEvent::Candidate(init)) => {
            assert_eq!(init.sdp_mid.as_deref(), Some("0"));
            assert_eq!(init.sdp_mline_index, Some(0));
        }
        other => panic!("expected candidate, got {:?}", other),
    }

    session.send_candidate(candidate()).unwrap();
    assert!(matches!(
        timeout(STEP, client.next_event()).await.unwrap(),
        Some(SignalingEvent::Candidate(_))
    ));
}

#[tokio::test]
async fn test_second_receiver_rejected() {
    init_test_tracing();
    let (mut server, addr) = bind().await;

    let _first = client::connect(&addr, ConfigureMessage::new("s1", "image_raw"))
        .await
        .unwrap();
    let first_session = timeout(STEP, server.next_session()).await.unwrap().unwrap();

    let err = client::connect(&addr, ConfigureMessage::new("s2", "image_raw"))
        .await
        .unwrap_err();
    assert!(matches!(err, wrb_webrtc::Error::SignalingError(_)));
    assert!(err.to_string().contains("already have a receiver"));

    // The live session is untouched
    assert!(!first_session.done().is_closed());
    assert!(server.has_receiver());
}

#[tokio::test]
async fn test_idle_socket_does_not_take_slot() {
    init_test_tracing();
    let (mut server, addr) = bind().await;

    // Connected at the TCP level but never sends an upgrade request
    let _idle = TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!server.has_receiver());

    let _client = client::connect(&addr, ConfigureMessage::new("s1", "image_raw"))
        .await
        .unwrap();
    let mut session = timeout(STEP, server.next_session()).await.unwrap().unwrap();
    assert!(server.has_receiver());
    match timeout(STEP, session.next_event()).await.unwrap() {
        Some(SignalingEvent::Configure(setup)) => assert_eq!(setup.stream_id, "s1"),
        other => panic!("expected configure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_path_does_not_take_slot() {
    init_test_tracing();
    let (server, addr) = bind().await;

    assert!(connect_async(format!("ws://{}/elsewhere", addr)).await.is_err());
    assert!(!server.has_receiver());
}

#[tokio::test]
async fn test_slot_released_after_close() {
    init_test_tracing();
    let (mut server, addr) = bind().await;

    let first = client::connect(&addr, ConfigureMessage::new("s1", "image_raw"))
        .await
        .unwrap();
    let mut first_session = timeout(STEP, server.next_session()).await.unwrap().unwrap();

    first.close();
    loop {
        match timeout(STEP, first_session.next_event()).await.unwrap() {
            Some(SignalingEvent::Closed) | None => break,
            Some(_) => continue,
        }
    }
    assert!(first_session.done().is_closed());
    wait_for_free_slot(&server).await;

    let _second = client::connect(&addr, ConfigureMessage::new("s2", "image_raw"))
        .await
        .unwrap();
    let mut second_session = timeout(STEP, server.next_session()).await.unwrap().unwrap();
    match timeout(STEP, second_session.next_event()).await.unwrap() {
        Some(SignalingEvent::Configure(setup)) => assert_eq!(setup.stream_id, "s2"),
        other => panic!("expected configure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_path_not_found() {
    init_test_tracing();
    let (_server, addr) = bind().await;

    let err = connect_async(format!("ws://{}/elsewhere", addr))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_shutdown_ends_next_session() {
    init_test_tracing();
    let (mut server, _addr) = bind().await;
    server.shutdown();
    assert!(timeout(STEP, server.next_session()).await.unwrap().is_none());
}
