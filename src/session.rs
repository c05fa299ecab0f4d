//! The protocol session: connection state machine, frame routing and the
//! audio pipeline wiring.
//!
//! One [`LiveSession`] owns at most one transport connection. All sends are
//! serialized through a single writer and every inbound frame is fully
//! handled before the next one is read, so state transitions need no
//! locking discipline beyond that ordering.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::{AudioCapture, AudioPlayback, CaptureEvent, VolumeMeter};
use crate::error::LiveError;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::config::LiveConfig;
use crate::types::events::{
    CloseReason, Event, EventBus, EventHandler, LogPayload, LogTag, StreamingLog, Subscription,
};
use crate::types::protocol::{
    Blob, ClientContent, ClientFrame, Content, FunctionResponse, Part, REALTIME_AUDIO_MIME,
    RealtimeInput, ServerContent, ServerFrame, ToolResponse,
};

/// Connection lifecycle. `connect()` drives `Disconnected → Connecting →
/// AwaitingSetupAck → Active`; teardown passes through `Closing` back to
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingSetupAck,
    Active,
    Closing,
}

pub struct LiveSession {
    state: StdMutex<SessionState>,
    event_bus: EventBus,
    transport_factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Fires on teardown; cancels an in-flight `connect()` and the read loop.
    cancel_tx: watch::Sender<()>,
    microphone: StdMutex<Option<AudioCapture>>,
    mic_task: StdMutex<Option<JoinHandle<()>>>,
    playback: StdMutex<Option<AudioPlayback>>,
    input_volume_tx: watch::Sender<f32>,
}

impl LiveSession {
    pub fn new(transport_factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(());
        let (input_volume_tx, _) = watch::channel(0.0f32);
        Arc::new(Self {
            state: StdMutex::new(SessionState::Disconnected),
            event_bus: EventBus::new(),
            transport_factory,
            transport: Mutex::new(None),
            cancel_tx,
            microphone: StdMutex::new(None),
            mic_task: StdMutex::new(None),
            playback: StdMutex::new(None),
            input_volume_tx,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("Mutex should not be poisoned")
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Registers an event handler; the returned guard deregisters it on drop.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Subscription {
        self.event_bus.subscribe(handler)
    }

    /// Closure convenience over [`LiveSession::subscribe`].
    pub fn subscribe_fn<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.event_bus.subscribe_fn(handler)
    }

    /// Opens the transport, performs the setup handshake and transitions to
    /// `Active`. Valid only while `Disconnected`. Resolves once the server
    /// acknowledges the setup frame; any other frame or a transport loss
    /// before that aborts the attempt back to `Disconnected`.
    ///
    /// No timeout is applied here; callers wanting a bounded attempt wrap
    /// this future (e.g. in `tokio::time::timeout`).
    pub async fn connect(self: &Arc<Self>, config: LiveConfig) -> Result<(), LiveError> {
        {
            let mut state = self.state.lock().expect("Mutex should not be poisoned");
            if *state != SessionState::Disconnected {
                return Err(LiveError::State {
                    op: "connect",
                    state: *state,
                });
            }
            *state = SessionState::Connecting;
        }

        // Restores Disconnected on every failure path out of this function;
        // defused right before returning Ok. Leaves a concurrent teardown's
        // transitions alone.
        let guard = scopeguard::guard(self.clone(), |session| {
            let mut state = session.state.lock().expect("Mutex should not be poisoned");
            if matches!(
                *state,
                SessionState::Connecting | SessionState::AwaitingSetupAck
            ) {
                *state = SessionState::Disconnected;
            }
        });

        let mut cancel = self.cancel_tx.subscribe();

        let (transport, mut events) = self
            .transport_factory
            .create_transport()
            .await
            .map_err(|e| LiveError::Connection(e.to_string()))?;
        *self.transport.lock().await = Some(transport.clone());

        // Wait for transport-open before the setup frame goes out.
        loop {
            if self.is_tearing_down() {
                self.abandon_transport().await;
                return Err(LiveError::Connection("connect cancelled".to_string()));
            }
            tokio::select! {
                biased;
                _ = cancel.changed() => continue,
                event = events.recv() => match event {
                    Some(TransportEvent::Connected) => break,
                    Some(TransportEvent::FrameReceived(_)) => {
                        self.abandon_transport().await;
                        return Err(LiveError::Protocol(
                            "frame received before transport open".to_string(),
                        ));
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        self.abandon_transport().await;
                        return Err(LiveError::Connection(
                            "transport closed while connecting".to_string(),
                        ));
                    }
                },
            }
        }

        self.push_log(
            LogTag::ConnectionOpen,
            LogPayload::Text("transport open".to_string()),
        );
        self.event_bus.dispatch(&Event::Open);

        let setup = ClientFrame::Setup(config);
        let payload = match serde_json::to_vec(&setup) {
            Ok(payload) => payload,
            Err(e) => {
                self.abandon_transport().await;
                return Err(LiveError::Protocol(e.to_string()));
            }
        };
        if let Err(e) = transport.send_frame(&payload).await {
            self.abandon_transport().await;
            return Err(LiveError::Connection(e.to_string()));
        }
        self.push_log(LogTag::ClientSetup, frame_log_payload(&setup));

        let cancelled = {
            let mut state = self.state.lock().expect("Mutex should not be poisoned");
            if *state != SessionState::Connecting {
                true
            } else {
                *state = SessionState::AwaitingSetupAck;
                false
            }
        };
        if cancelled {
            self.abandon_transport().await;
            return Err(LiveError::Connection("connect cancelled".to_string()));
        }

        // The ack is the only frame valid in this state.
        loop {
            if self.is_tearing_down() {
                self.abandon_transport().await;
                return Err(LiveError::Connection("connect cancelled".to_string()));
            }
            tokio::select! {
                biased;
                _ = cancel.changed() => continue,
                event = events.recv() => match event {
                    Some(TransportEvent::FrameReceived(data)) => {
                        match serde_json::from_slice::<ServerFrame>(&data) {
                            Ok(ServerFrame::SetupComplete(_)) => break,
                            Ok(frame) => {
                                self.abandon_transport().await;
                                return Err(LiveError::Protocol(format!(
                                    "expected setupComplete, got {}",
                                    frame.kind()
                                )));
                            }
                            Err(e) => {
                                self.abandon_transport().await;
                                return Err(LiveError::Protocol(format!(
                                    "malformed frame while awaiting setup ack: {e}"
                                )));
                            }
                        }
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        self.abandon_transport().await;
                        return Err(LiveError::Connection(
                            "transport closed while awaiting setup ack".to_string(),
                        ));
                    }
                    Some(TransportEvent::Connected) => continue,
                },
            }
        }

        let cancelled = {
            let mut state = self.state.lock().expect("Mutex should not be poisoned");
            if *state != SessionState::AwaitingSetupAck {
                true
            } else {
                *state = SessionState::Active;
                false
            }
        };
        if cancelled {
            self.abandon_transport().await;
            return Err(LiveError::Connection("connect cancelled".to_string()));
        }
        scopeguard::ScopeGuard::into_inner(guard);

        self.push_log(
            LogTag::ServerSetupComplete,
            LogPayload::Frame(json!({ "setupComplete": {} })),
        );
        self.event_bus.dispatch(&Event::SetupComplete);

        self.spawn_read_loop(events);
        info!("Session active");
        Ok(())
    }

    /// Tears the session down: stops the microphone, clears playback, closes
    /// the transport and emits one `Close` event. Idempotent; valid from any
    /// state, including during an in-flight `connect()`.
    pub async fn disconnect(&self) {
        self.teardown(CloseReason::Requested).await;
    }

    /// Sends user or system turns. `Active` only.
    pub async fn send_client_content(
        &self,
        turns: Vec<Content>,
        turn_complete: bool,
    ) -> Result<(), LiveError> {
        let frame = ClientFrame::ClientContent(ClientContent {
            turns,
            turn_complete,
        });
        let payload = frame_log_payload(&frame);
        self.send_frame("send_client_content", LogTag::ClientContent, frame, payload)
            .await
    }

    /// Sends realtime media chunks. `Active` only. The log entry carries the
    /// chunk MIME types rather than the (large, base64) payload.
    pub async fn send_realtime_input(&self, chunks: Vec<Blob>) -> Result<(), LiveError> {
        let summary = chunks
            .iter()
            .map(|chunk| chunk.mime_type.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let frame = ClientFrame::RealtimeInput(RealtimeInput {
            media_chunks: chunks,
        });
        self.send_frame(
            "send_realtime_input",
            LogTag::ClientRealtimeInput,
            frame,
            LogPayload::Text(summary),
        )
        .await
    }

    /// Answers a tool call. Each response's id must echo the id of the call
    /// it answers; unmatched ids are a caller error, not a protocol error.
    pub async fn send_tool_response(
        &self,
        function_responses: Vec<FunctionResponse>,
    ) -> Result<(), LiveError> {
        let frame = ClientFrame::ToolResponse(ToolResponse { function_responses });
        let payload = frame_log_payload(&frame);
        self.send_frame(
            "send_tool_response",
            LogTag::ClientToolResponse,
            frame,
            payload,
        )
        .await
    }

    /// Acquires the microphone and starts forwarding encoded chunks as
    /// realtime input. `Active` only; a no-op when already capturing.
    /// Muting is modeled as `stop_microphone()`/`start_microphone()`.
    pub fn start_microphone(self: &Arc<Self>) -> Result<(), LiveError> {
        {
            let state = self.state.lock().expect("Mutex should not be poisoned");
            if *state != SessionState::Active {
                return Err(LiveError::State {
                    op: "start_microphone",
                    state: *state,
                });
            }
        }

        let mut microphone = self.microphone.lock().expect("Mutex should not be poisoned");
        if microphone.is_some() {
            return Ok(());
        }
        let (capture, mut capture_events) = AudioCapture::start()?;
        *microphone = Some(capture);
        drop(microphone);

        let session = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = capture_events.recv().await {
                match event {
                    CaptureEvent::Chunk(data) => {
                        let chunk = Blob {
                            mime_type: REALTIME_AUDIO_MIME.to_string(),
                            data,
                        };
                        if let Err(e) = session.send_realtime_input(vec![chunk]).await {
                            debug!("Stopping capture forwarding: {e}");
                            break;
                        }
                    }
                    CaptureEvent::Volume(volume) => {
                        let _ = session.input_volume_tx.send(volume);
                    }
                }
            }
        });
        *self.mic_task.lock().expect("Mutex should not be poisoned") = Some(task);
        Ok(())
    }

    /// Releases the capture device and joins its thread. No-op when the
    /// microphone is not running.
    pub fn stop_microphone(&self) {
        if let Some(mut capture) = self
            .microphone
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
        {
            capture.stop();
        }
        if let Some(task) = self
            .mic_task
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
        {
            task.abort();
        }
    }

    /// Smoothed microphone volume, updated once per captured chunk.
    pub fn input_volume(&self) -> watch::Receiver<f32> {
        self.input_volume_tx.subscribe()
    }

    /// Attaches the speaker pipeline; inbound audio parts are decoded into
    /// it from then on. A no-op when already attached.
    pub fn enable_playback(&self) -> Result<(), LiveError> {
        let mut playback = self.playback.lock().expect("Mutex should not be poisoned");
        if playback.is_none() {
            *playback = Some(AudioPlayback::start()?);
        }
        Ok(())
    }

    /// Freezes playback output, preserving the queue.
    pub fn pause_playback(&self) {
        if let Some(playback) = self
            .playback
            .lock()
            .expect("Mutex should not be poisoned")
            .as_ref()
        {
            playback.pause();
        }
    }

    /// Restarts playback from idle without altering queued audio.
    pub fn resume_playback(&self) {
        if let Some(playback) = self
            .playback
            .lock()
            .expect("Mutex should not be poisoned")
            .as_ref()
        {
            playback.resume();
        }
    }

    /// Meter fed by decoded playback audio, when playback is attached.
    pub fn output_meter(&self) -> Option<Arc<StdMutex<VolumeMeter>>> {
        self.playback
            .lock()
            .expect("Mutex should not be poisoned")
            .as_ref()
            .map(|playback| playback.meter())
    }

    fn is_tearing_down(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Closing | SessionState::Disconnected
        )
    }

    async fn abandon_transport(&self) {
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
    }

    async fn teardown(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock().expect("Mutex should not be poisoned");
            if matches!(
                *state,
                SessionState::Disconnected | SessionState::Closing
            ) {
                return;
            }
            *state = SessionState::Closing;
        }
        let _ = self.cancel_tx.send(());

        self.stop_microphone();
        // Dropping the pipeline joins its thread and clears the queue.
        *self.playback.lock().expect("Mutex should not be poisoned") = None;
        self.abandon_transport().await;

        *self.state.lock().expect("Mutex should not be poisoned") = SessionState::Disconnected;
        self.push_log(
            LogTag::ConnectionClose,
            LogPayload::Text(format!("disconnected ({reason:?})")),
        );
        self.event_bus.dispatch(&Event::Close { reason });
        info!("Session closed: {reason:?}");
    }

    fn spawn_read_loop(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let session = self.clone();
        let mut cancel = self.cancel_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.changed() => {
                        debug!("Read loop cancelled");
                        return;
                    }
                    event = events.recv() => match event {
                        Some(TransportEvent::FrameReceived(data)) => session.handle_frame(&data),
                        Some(TransportEvent::Connected) => {
                            debug!("Transport connected event received");
                        }
                        Some(TransportEvent::Disconnected) | None => {
                            session.teardown(CloseReason::TransportError).await;
                            return;
                        }
                    },
                }
            }
        });
    }

    /// Classifies one inbound message and dispatches it. Malformed payloads
    /// are logged and dropped; the session stays `Active`.
    fn handle_frame(&self, data: &[u8]) {
        let frame: ServerFrame = match serde_json::from_slice(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding unrecognized frame: {e}");
                self.push_log(
                    LogTag::Error,
                    LogPayload::Text(format!("unrecognized frame: {e}")),
                );
                return;
            }
        };

        match frame {
            ServerFrame::SetupComplete(_) => {
                self.push_log(
                    LogTag::ServerSetupComplete,
                    LogPayload::Frame(json!({ "setupComplete": {} })),
                );
                self.event_bus.dispatch(&Event::SetupComplete);
            }
            ServerFrame::ToolCall(tool_call) => {
                self.push_log(
                    LogTag::ServerToolCall,
                    LogPayload::Frame(serde_json::to_value(&tool_call).unwrap_or(Value::Null)),
                );
                self.event_bus.dispatch(&Event::ToolCall(tool_call));
            }
            ServerFrame::ToolCallCancellation(cancellation) => {
                self.push_log(
                    LogTag::ServerToolCallCancellation,
                    LogPayload::Frame(serde_json::to_value(&cancellation).unwrap_or(Value::Null)),
                );
                self.event_bus
                    .dispatch(&Event::ToolCallCancellation(cancellation));
            }
            ServerFrame::ServerContent(content) => self.handle_server_content(content),
        }
    }

    fn handle_server_content(&self, content: ServerContent) {
        if content.interrupted {
            self.push_log(
                LogTag::ServerContent,
                LogPayload::Text("interrupted".to_string()),
            );
            if let Some(playback) = self
                .playback
                .lock()
                .expect("Mutex should not be poisoned")
                .as_ref()
            {
                playback.interrupt();
            }
            self.event_bus.dispatch(&Event::Interrupted);
            return;
        }

        if content.turn_complete {
            self.push_log(
                LogTag::ServerContent,
                LogPayload::Text("turnComplete".to_string()),
            );
            self.event_bus.dispatch(&Event::TurnComplete);
        }

        if let Some(turn) = content.model_turn {
            let (audio_parts, other_parts): (Vec<Part>, Vec<Part>) =
                turn.parts.into_iter().partition(Part::is_audio);

            for part in audio_parts {
                let Some(blob) = part.inline_data else { continue };
                match BASE64.decode(blob.data.as_bytes()) {
                    Ok(pcm) => {
                        self.push_log(
                            LogTag::ServerAudio,
                            LogPayload::Text(format!("audio buffer ({} bytes)", pcm.len())),
                        );
                        if let Some(playback) = self
                            .playback
                            .lock()
                            .expect("Mutex should not be poisoned")
                            .as_ref()
                        {
                            playback.enqueue(&pcm);
                        }
                        self.event_bus.dispatch(&Event::Audio(Bytes::from(pcm)));
                    }
                    Err(e) => {
                        warn!("Discarding undecodable audio part: {e}");
                        self.push_log(
                            LogTag::Error,
                            LogPayload::Text(format!("undecodable audio part: {e}")),
                        );
                    }
                }
            }

            if !other_parts.is_empty() {
                let remainder = ServerContent {
                    model_turn: Some(Content {
                        role: turn.role,
                        parts: other_parts,
                    }),
                    ..Default::default()
                };
                self.push_log(
                    LogTag::ServerContent,
                    LogPayload::Frame(serde_json::to_value(&remainder).unwrap_or(Value::Null)),
                );
                self.event_bus.dispatch(&Event::Content(remainder));
            }
        }
    }

    /// Single writer: the transport handle stays locked for the duration of
    /// the send, so frames are never reordered relative to each other.
    async fn send_frame(
        &self,
        op: &'static str,
        tag: LogTag,
        frame: ClientFrame,
        log_payload: LogPayload,
    ) -> Result<(), LiveError> {
        {
            let state = self.state.lock().expect("Mutex should not be poisoned");
            if *state != SessionState::Active {
                return Err(LiveError::State { op, state: *state });
            }
        }

        let payload = serde_json::to_vec(&frame).map_err(|e| LiveError::Protocol(e.to_string()))?;
        {
            let transport_guard = self.transport.lock().await;
            let transport = transport_guard
                .as_ref()
                .ok_or_else(|| LiveError::Connection("transport is not available".to_string()))?;
            transport
                .send_frame(&payload)
                .await
                .map_err(|e| LiveError::Connection(e.to_string()))?;
        }
        self.push_log(tag, log_payload);
        Ok(())
    }

    fn push_log(&self, tag: LogTag, payload: LogPayload) {
        self.event_bus
            .dispatch(&Event::Log(StreamingLog::new(tag, payload)));
    }
}

fn frame_log_payload(frame: &ClientFrame) -> LogPayload {
    LogPayload::Frame(serde_json::to_value(frame).unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, MockTransportFactory};
    use crate::types::config::LiveConfig;
    use std::time::Duration;
    use tokio::time::sleep;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<Event>>,
    }

    impl Recorder {
        fn snapshot(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn close_count(&self) -> usize {
            self.snapshot()
                .iter()
                .filter(|event| matches!(event, Event::Close { .. }))
                .count()
        }
    }

    impl EventHandler for Recorder {
        fn handle_event(&self, event: &Event) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn test_config() -> LiveConfig {
        LiveConfig::new("models/gemini-2.0-flash-exp")
    }

    fn setup_complete_frame() -> TransportEvent {
        TransportEvent::FrameReceived(Bytes::from_static(br#"{"setupComplete":{}}"#))
    }

    fn frame(json: &str) -> TransportEvent {
        TransportEvent::FrameReceived(Bytes::from(json.as_bytes().to_vec()))
    }

    async fn wait_for(recorder: &Recorder, predicate: impl Fn(&[Event]) -> bool) {
        for _ in 0..200 {
            if predicate(&recorder.snapshot()) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("expected event did not arrive");
    }

    async fn active_session() -> (
        Arc<LiveSession>,
        Arc<MockTransport>,
        mpsc::Sender<TransportEvent>,
        Arc<Recorder>,
        Subscription,
    ) {
        let (factory, transport, tx) = MockTransportFactory::new();
        let session = LiveSession::new(Arc::new(factory));
        let recorder = Arc::new(Recorder::default());
        let subscription = session.subscribe(recorder.clone());

        tx.send(setup_complete_frame()).await.unwrap();
        session.connect(test_config()).await.unwrap();

        (session, transport, tx, recorder, subscription)
    }

    #[tokio::test]
    async fn connect_reaches_active_on_setup_complete() {
        let (session, transport, _tx, recorder, _sub) = active_session().await;

        assert_eq!(session.state(), SessionState::Active);

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["setup"]["model"], "models/gemini-2.0-flash-exp");

        let events = recorder.snapshot();
        assert!(events.iter().any(|e| matches!(e, Event::Open)));
        assert!(events.iter().any(|e| matches!(e, Event::SetupComplete)));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Log(StreamingLog { tag: LogTag::ClientSetup, .. })
        )));
    }

    #[tokio::test]
    async fn connect_outside_disconnected_is_a_state_error() {
        let (session, _transport, _tx, _recorder, _sub) = active_session().await;

        let err = session.connect(test_config()).await.unwrap_err();
        assert!(matches!(
            err,
            LiveError::State { op: "connect", state: SessionState::Active }
        ));
    }

    #[tokio::test]
    async fn unexpected_frame_while_awaiting_ack_aborts_connect() {
        let (factory, transport, tx) = MockTransportFactory::new();
        let session = LiveSession::new(Arc::new(factory));

        tx.send(frame(r#"{"toolCall":{"functionCalls":[]}}"#))
            .await
            .unwrap();
        let err = session.connect(test_config()).await.unwrap_err();

        assert!(matches!(err, LiveError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn malformed_frame_while_awaiting_ack_aborts_connect() {
        let (factory, _transport, tx) = MockTransportFactory::new();
        let session = LiveSession::new(Arc::new(factory));

        tx.send(frame("not json")).await.unwrap();
        let err = session.connect(test_config()).await.unwrap_err();

        assert!(matches!(err, LiveError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn sends_outside_active_fail_without_a_write() {
        let (factory, transport, _tx) = MockTransportFactory::new();
        let session = LiveSession::new(Arc::new(factory));

        let err = session
            .send_client_content(vec![Content::user_text("hi")], true)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::State { .. }));

        let err = session.send_realtime_input(vec![]).await.unwrap_err();
        assert!(matches!(err, LiveError::State { .. }));

        let err = session.send_tool_response(vec![]).await.unwrap_err();
        assert!(matches!(err, LiveError::State { .. }));

        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_emits_one_close() {
        let (session, transport, _tx, recorder, _sub) = active_session().await;

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(transport.is_closed());
        assert_eq!(recorder.close_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_during_connect_aborts_to_disconnected() {
        let (factory, _transport, _tx) = MockTransportFactory::new();
        let session = LiveSession::new(Arc::new(factory));

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect(test_config()).await })
        };
        // Let connect reach the setup-ack wait, then cancel it.
        sleep(Duration::from_millis(50)).await;
        session.disconnect().await;

        let result = connecting.await.unwrap();
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn transport_drop_tears_down_with_one_close() {
        let (session, _transport, tx, recorder, _sub) = active_session().await;

        tx.send(TransportEvent::Disconnected).await.unwrap();
        wait_for(&recorder, |events| {
            events
                .iter()
                .any(|e| matches!(e, Event::Close { reason: CloseReason::TransportError }))
        })
        .await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(recorder.close_count(), 1);
    }

    #[tokio::test]
    async fn tool_call_response_echoes_the_call_id() {
        let (session, transport, tx, recorder, _sub) = active_session().await;

        tx.send(frame(
            r#"{"toolCall":{"functionCalls":[{"id":"1","name":"render_altair","args":{"json_graph":"{}"}}]}}"#,
        ))
        .await
        .unwrap();

        wait_for(&recorder, |events| {
            events.iter().any(|e| matches!(e, Event::ToolCall(_)))
        })
        .await;

        let call = recorder
            .snapshot()
            .into_iter()
            .find_map(|event| match event {
                Event::ToolCall(call) => Some(call),
                _ => None,
            })
            .unwrap();
        assert_eq!(call.function_calls[0].id, "1");

        session
            .send_tool_response(vec![FunctionResponse {
                id: call.function_calls[0].id.clone(),
                response: json!({ "output": { "success": true } }),
            }])
            .await
            .unwrap();

        let sent = transport.sent_frames();
        let response = sent.last().unwrap();
        assert_eq!(response["toolResponse"]["functionResponses"][0]["id"], "1");
    }

    #[tokio::test]
    async fn audio_parts_dispatch_decoded_pcm() {
        let (session, _transport, tx, recorder, _sub) = active_session().await;

        let encoded = BASE64.encode([0x00u8, 0x40, 0x00, 0xC0]);
        let content = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": encoded } }
                    ]
                }
            }
        });
        tx.send(frame(&content.to_string())).await.unwrap();

        wait_for(&recorder, |events| {
            events.iter().any(|e| matches!(e, Event::Audio(_)))
        })
        .await;

        let events = recorder.snapshot();
        let audio = events
            .iter()
            .find_map(|event| match event {
                Event::Audio(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(&audio[..], &[0x00, 0x40, 0x00, 0xC0]);

        // A pure-audio turn produces no content event.
        assert!(!events.iter().any(|e| matches!(e, Event::Content(_))));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Log(StreamingLog { tag: LogTag::ServerAudio, .. })
        )));

        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn mixed_turn_splits_audio_from_content() {
        let (_session, _transport, tx, recorder, _sub) = active_session().await;

        let encoded = BASE64.encode([0x00u8, 0x40]);
        let content = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": encoded } },
                        { "text": "and here is the chart" }
                    ]
                }
            }
        });
        tx.send(frame(&content.to_string())).await.unwrap();

        wait_for(&recorder, |events| {
            events.iter().any(|e| matches!(e, Event::Content(_)))
        })
        .await;

        let events = recorder.snapshot();
        assert!(events.iter().any(|e| matches!(e, Event::Audio(_))));
        let content = events
            .iter()
            .find_map(|event| match event {
                Event::Content(content) => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        let parts = &content.model_turn.unwrap().parts;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text.as_deref(), Some("and here is the chart"));
    }

    #[tokio::test]
    async fn interrupted_and_turn_complete_are_dispatched() {
        let (_session, _transport, tx, recorder, _sub) = active_session().await;

        tx.send(frame(r#"{"serverContent":{"turnComplete":true}}"#))
            .await
            .unwrap();
        wait_for(&recorder, |events| {
            events.iter().any(|e| matches!(e, Event::TurnComplete))
        })
        .await;

        tx.send(frame(r#"{"serverContent":{"interrupted":true}}"#))
            .await
            .unwrap();
        wait_for(&recorder, |events| {
            events.iter().any(|e| matches!(e, Event::Interrupted))
        })
        .await;
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_teardown() {
        let (session, _transport, tx, recorder, _sub) = active_session().await;

        tx.send(frame("garbage")).await.unwrap();
        tx.send(frame(r#"{"serverContent":{"turnComplete":true}}"#))
            .await
            .unwrap();

        wait_for(&recorder, |events| {
            events.iter().any(|e| matches!(e, Event::TurnComplete))
        })
        .await;

        let events = recorder.snapshot();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Log(StreamingLog { tag: LogTag::Error, .. })
        )));
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(recorder.close_count(), 0);
    }
}
