//! WebSocket transport for the live endpoint.
//!
//! The session talks to the network through the [`Transport`] trait so the
//! protocol state machine can be driven by a mock in tests. The real
//! implementation uses tokio-tungstenite; the service speaks JSON in both
//! text and binary frames, so the read pump forwards the payload of either
//! kind unchanged.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Default endpoint for the bidirectional generate-content stream.
pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A frame has been received from the server.
    FrameReceived(Bytes),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one serialized frame to the server.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

pub struct WebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl WebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        let text = std::str::from_utf8(frame)
            .map_err(|e| anyhow::anyhow!("Frame is not valid UTF-8: {}", e))?;

        debug!("--> Sending frame: {} bytes", frame.len());
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            let _ = sink.close().await;
        }
    }
}

/// Factory that dials the live endpoint with an API key.
pub struct WebSocketTransportFactory {
    url: String,
}

impl WebSocketTransportFactory {
    pub fn new(api_key: &str) -> Self {
        Self::with_endpoint(LIVE_ENDPOINT, api_key)
    }

    pub fn with_endpoint(endpoint: &str, api_key: &str) -> Self {
        Self {
            url: format!("{endpoint}?key={api_key}"),
        }
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("Dialing live endpoint");
        let (client, _response) = connect_async(&self.url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();

        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = Arc::new(WebSocketTransport::new(sink));

        tokio::task::spawn(read_pump(stream, event_tx.clone()));

        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                if msg.is_text() || msg.is_binary() {
                    let data = msg.into_data();
                    trace!("<-- Received frame: {} bytes", data.len());
                    if event_tx
                        .send(TransportEvent::FrameReceived(data))
                        .await
                        .is_err()
                    {
                        warn!("Event receiver dropped, closing read pump");
                        break;
                    }
                } else if msg.is_close() {
                    trace!("Received close frame");
                    break;
                }
            }
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records every frame the session writes; used by state-machine tests.
    #[derive(Default)]
    pub struct MockTransport {
        pub sent: StdMutex<Vec<Vec<u8>>>,
        pub closed: AtomicBool,
    }

    impl MockTransport {
        pub fn sent_frames(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|raw| serde_json::from_slice(raw).expect("sent frame should be JSON"))
                .collect()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_frame(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        async fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out a scripted event stream once; the test keeps the sender to
    /// inject frames as if they arrived from the server. A `Connected`
    /// event is queued up front, ahead of anything the test enqueues.
    pub struct MockTransportFactory {
        transport: Arc<MockTransport>,
        events_rx: StdMutex<Option<mpsc::Receiver<TransportEvent>>>,
    }

    impl MockTransportFactory {
        pub fn new() -> (Self, Arc<MockTransport>, mpsc::Sender<TransportEvent>) {
            let (tx, rx) = mpsc::channel(64);
            tx.try_send(TransportEvent::Connected)
                .expect("fresh channel should have capacity");
            let transport = Arc::new(MockTransport::default());
            let factory = Self {
                transport: transport.clone(),
                events_rx: StdMutex::new(Some(rx)),
            };
            (factory, transport, tx)
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let rx = self
                .events_rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow::anyhow!("transport already created"))?;
            Ok((self.transport.clone(), rx))
        }
    }
}
