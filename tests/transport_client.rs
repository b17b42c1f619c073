//! Transport client behavior against a scripted proxy endpoint.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::TestProxy;
use parking_lot::Mutex;

use voxlink::core::transport::{ProxyClient, TransportConfig};

fn config(url: &str) -> TransportConfig {
    common::init_tracing();
    let mut config = TransportConfig::new(url, "esp32-cafe0001");
    config.network_timeout = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn connect_reports_state_with_zero_close_code() {
    let proxy = TestProxy::spawn().await;
    let mut client = ProxyClient::new(config(&proxy.url));

    let events: Arc<Mutex<Vec<(bool, u16)>>> = Arc::new(Mutex::new(Vec::new()));
    let callback_events = events.clone();
    client.on_state(Arc::new(move |connected, close_code| {
        let events = callback_events.clone();
        Box::pin(async move {
            events.lock().push((connected, close_code));
        })
    }));

    client.connect().await.unwrap();
    assert!(client.is_connected());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.lock().first(), Some(&(true, 0)));

    client.disconnect().await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn binary_frames_reach_the_proxy_in_order() {
    let proxy = TestProxy::spawn().await;
    let mut client = ProxyClient::new(config(&proxy.url));
    client.connect().await.unwrap();

    for i in 0..5u8 {
        client
            .send_audio(Bytes::from(vec![i; 3_200]))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let frames = proxy.binary_frames();
    assert_eq!(frames.len(), 5);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.len(), 3_200);
        assert!(frame.iter().all(|&b| b == i as u8));
    }

    let stats = client.stats();
    assert_eq!(stats.frames_sent, 5);
    assert_eq!(stats.bytes_sent, 5 * 3_200);

    client.disconnect().await;
}

#[tokio::test]
async fn empty_end_of_turn_frame_is_permitted() {
    let proxy = TestProxy::spawn().await;
    let mut client = ProxyClient::new(config(&proxy.url));
    client.connect().await.unwrap();

    client.send_audio(Bytes::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let frames = proxy.binary_frames();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_empty());

    client.disconnect().await;
}

#[tokio::test]
async fn speech_events_are_dispatched() {
    let proxy = TestProxy::spawn().await;
    let mut client = ProxyClient::new(config(&proxy.url));

    let events: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let callback_events = events.clone();
    client.on_speech(Arc::new(move |is_speaking| {
        let events = callback_events.clone();
        Box::pin(async move {
            events.lock().push(is_speaking);
        })
    }));

    client.connect().await.unwrap();
    proxy.send_text(r#"{"type":"speech_start"}"#);
    proxy.send_text(r#"{"type":"speech_end"}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*events.lock(), vec![true, false]);
    client.disconnect().await;
}

#[tokio::test]
async fn garbage_control_frames_do_not_kill_the_connection() {
    let proxy = TestProxy::spawn().await;
    let mut client = ProxyClient::new(config(&proxy.url));

    let events: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let callback_events = events.clone();
    client.on_speech(Arc::new(move |is_speaking| {
        let events = callback_events.clone();
        Box::pin(async move {
            events.lock().push(is_speaking);
        })
    }));

    client.connect().await.unwrap();
    proxy.send_text("{this is not json");
    proxy.send_text(r#"{"type":"subtitle","text":"hi"}"#);
    proxy.send_text(r#"{"type":"speech_start"}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(client.is_connected());
    assert_eq!(*events.lock(), vec![true]);
    assert_eq!(client.stats().decode_errors, 1);

    client.disconnect().await;
}

#[tokio::test]
async fn peer_close_code_reaches_the_state_callback() {
    let proxy = TestProxy::spawn().await;
    let mut client = ProxyClient::new(config(&proxy.url));

    let events: Arc<Mutex<Vec<(bool, u16)>>> = Arc::new(Mutex::new(Vec::new()));
    let callback_events = events.clone();
    client.on_state(Arc::new(move |connected, close_code| {
        let events = callback_events.clone();
        Box::pin(async move {
            events.lock().push((connected, close_code));
        })
    }));

    client.connect().await.unwrap();
    proxy.send_close(1_001);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!client.is_connected());
    let events = events.lock();
    assert!(events.contains(&(false, 1_001)));

    // Sending after the drop fails without blocking the caller.
    drop(events);
    let result = client.send_audio(Bytes::from_static(&[0, 0])).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn received_binary_audio_is_delivered_verbatim() {
    let proxy = TestProxy::spawn().await;
    let mut client = ProxyClient::new(config(&proxy.url));

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let callback_received = received.clone();
    client.on_audio(Arc::new(move |data| {
        let received = callback_received.clone();
        Box::pin(async move {
            received.lock().extend_from_slice(&data);
        })
    }));

    client.connect().await.unwrap();
    let payload: Vec<u8> = (0..=255).cycle().take(4_800).map(|b| b as u8).collect();
    proxy.send_binary(payload.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*received.lock(), payload);
    assert_eq!(client.stats().bytes_received, 4_800);

    client.disconnect().await;
}
