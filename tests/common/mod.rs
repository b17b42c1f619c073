//! Shared test collaborators: stub hardware, an in-memory KV store and a
//! scriptable proxy endpoint.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;

use voxlink::core::capture::{CaptureResult, I2sSource};
use voxlink::core::identity::{KvError, KvStore};
use voxlink::core::playback::{I2sSink, PlaybackResult};

/// Route core logs into the test harness output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Microphone stub producing a constant 32-bit sample at the real I²S
/// frame cadence (256 samples ≈ 16 ms at 16 kHz).
pub struct ToneSource {
    raw_sample: i32,
    frame_samples: usize,
    pace: Duration,
}

impl ToneSource {
    pub fn silence() -> Arc<Self> {
        Arc::new(Self {
            raw_sample: 0,
            frame_samples: 256,
            pace: Duration::from_millis(16),
        })
    }

    pub fn tone(raw_sample: i32) -> Arc<Self> {
        Arc::new(Self {
            raw_sample,
            frame_samples: 256,
            pace: Duration::from_millis(16),
        })
    }
}

#[async_trait]
impl I2sSource for ToneSource {
    async fn read_frame(&self, frame: &mut [i32]) -> CaptureResult<usize> {
        tokio::time::sleep(self.pace).await;
        let n = self.frame_samples.min(frame.len());
        frame[..n].fill(self.raw_sample);
        Ok(n)
    }
}

/// Speaker stub recording everything written to it.
pub struct RecordingSink {
    bytes: Mutex<Vec<u8>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(Vec::new()),
        })
    }

    pub fn written(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn written_len(&self) -> usize {
        self.bytes.lock().len()
    }
}

#[async_trait]
impl I2sSink for RecordingSink {
    async fn write(&self, pcm: &[u8]) -> PlaybackResult<()> {
        self.bytes.lock().extend_from_slice(pcm);
        Ok(())
    }
}

/// In-memory stand-in for the host key-value store.
#[derive(Default)]
pub struct MemoryKvStore {
    values: Mutex<std::collections::HashMap<(String, String), String>>,
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .values
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), KvError> {
        self.values
            .lock()
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

/// Scriptable proxy endpoint: accepts one device connection, records every
/// binary frame it receives and injects whatever the test tells it to.
pub struct TestProxy {
    pub url: String,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    inject_tx: mpsc::UnboundedSender<Message>,
    _server: JoinHandle<()>,
}

impl TestProxy {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let url = format!("ws://{addr}/ws");

        let received = Arc::new(Mutex::new(Vec::new()));
        let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<Message>();

        let server_received = received.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let websocket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = websocket.split();

            loop {
                tokio::select! {
                    incoming = source.next() => {
                        match incoming {
                            Some(Ok(Message::Binary(data))) => {
                                server_received.lock().push(data.to_vec());
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        }
                    }
                    injected = inject_rx.recv() => {
                        match injected {
                            Some(message) => {
                                if sink.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Self {
            url,
            received,
            inject_tx,
            _server: server,
        }
    }

    /// Binary frames received from the device so far.
    pub fn binary_frames(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    pub fn binary_frame_count(&self) -> usize {
        self.received.lock().len()
    }

    /// Inject a text control frame toward the device.
    pub fn send_text(&self, text: &str) {
        self.inject_tx
            .send(Message::Text(text.to_string().into()))
            .unwrap();
    }

    /// Inject a binary PCM frame toward the device.
    pub fn send_binary(&self, bytes: Vec<u8>) {
        self.inject_tx.send(Message::Binary(bytes.into())).unwrap();
    }

    /// Close the connection with the given close code.
    pub fn send_close(&self, code: u16) {
        self.inject_tx
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })))
            .unwrap();
    }
}
