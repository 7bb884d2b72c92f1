//! §4.F Kernel session manager: owns one live WebSocket kernel session, its
//! read pump + write pump, keep-alive, and the correlation table the
//! dispatcher routes replies through.
//!
//! Grounded on the zed `remote_kernels.rs` shape (open a WebSocket to
//! `.../api/kernels/{id}/channels?token=...`, split into reader/writer,
//! spawn a receiving task and a routing task around a bounded channel) and
//! `kernel_manager.rs`'s `Arc<StdMutex<HashMap<...>>>` correlation map
//! idiom, generalized from ZMQ multipart to a single WebSocket text stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use crate::colab_api::ColabApiClient;
use crate::error::{Result, RuntimeError};
use crate::jupyter_codec::{self, IncomingMessage, WireMessage};
use crate::types::{Assignment, ProxyInfo, SocketState};

pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Seam the session manager is generic over: anything that can carry
/// Jupyter WebSocket frames in both directions. The production path plugs
/// in `tokio_tungstenite`'s `WebSocketStream` (which already implements
/// `Sink`/`Stream` for `Message`); tests substitute an in-process scripted
/// fake, following the `JupyterClient`/`KernelConnection` seam in
/// `ekzhang-jute`.
pub trait KernelTransport:
    Sink<Message, Error = WsError> + Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send
{
}

impl<T> KernelTransport for T where
    T: Sink<Message, Error = WsError> + Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send
{
}

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_DEADLINE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const OUTBOUND_QUEUE_DEPTH: usize = 64;
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Events a session surfaces to its owner. The session manager does not
/// reconnect on its own (spec §4.F, §9 Open Question 2); it just reports.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TransportLost(String),
    Closed,
}

/// Per-`msg_id` correlation table: the dispatcher installs a channel before
/// sending, and the read pump forwards every classified message addressed
/// to that `parent_header.msg_id`.
type CorrelationTable = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<IncomingMessage>>>>;

pub struct KernelSession {
    pub session_id: String,
    pub kernel_id: String,
    pub path: String,
    pub assignment: Assignment,
    pub proxy: ProxyInfo,

    state: Arc<StdMutex<SocketState>>,
    last_activity: Arc<StdMutex<Instant>>,
    outbound: mpsc::Sender<Message>,
    correlation: CorrelationTable,
    events: broadcast::Sender<SessionEvent>,
    /// Spec §4.G: at most one `PendingExecution` may be active per session.
    /// A plain `tokio::sync::Mutex` used with `try_lock` gives "reject, don't
    /// wait" serialization rather than queuing callers.
    busy: tokio::sync::Mutex<()>,

    _read_task: tokio::task::JoinHandle<()>,
    _write_task: tokio::task::JoinHandle<()>,
    _keepalive_task: tokio::task::JoinHandle<()>,
}

impl KernelSession {
    /// Spec §4.F `connect`: ensure a Jupyter session exists for `path`
    /// (creating one if needed), open the WebSocket, and spawn the pumps.
    pub async fn connect(
        client: &ColabApiClient,
        assignment: Assignment,
        proxy: ProxyInfo,
        path: &str,
        kernel_name: &str,
    ) -> Result<KernelSession> {
        let existing = client.list_sessions(&proxy).await?;
        let session_info = match existing.into_iter().find(|s| s.path == path) {
            Some(found) => found,
            None => client.create_session(&proxy, path, kernel_name).await?,
        };

        let ws_scheme_url = proxy.url.replacen("http", "ws", 1);
        let ws_url = format!(
            "{ws_scheme_url}/api/kernels/{}/channels?token={}",
            session_info.kernel.id, proxy.token
        );

        let (ws_stream, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(ws_url),
        )
        .await
        .map_err(|_| RuntimeError::Timeout)??;

        Ok(Self::from_transport(
            session_info.id,
            session_info.kernel.id,
            path.to_string(),
            assignment,
            proxy,
            ws_stream,
        ))
    }

    /// Spawns the read/write/keepalive pumps over an already-open transport.
    /// Split out of `connect` so tests can hand it a scripted fake instead of
    /// a live WebSocket.
    pub(crate) fn from_transport(
        session_id: String,
        kernel_id: String,
        path: String,
        assignment: Assignment,
        proxy: ProxyInfo,
        transport: impl KernelTransport + 'static,
    ) -> KernelSession {
        let (mut sink, mut stream) = transport.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let correlation: CorrelationTable = Arc::new(StdMutex::new(HashMap::new()));
        let state = Arc::new(StdMutex::new(SocketState::Open));
        let last_activity = Arc::new(StdMutex::new(Instant::now()));
        let last_pong = Arc::new(StdMutex::new(Instant::now()));

        let write_task = {
            let state = state.clone();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    if let Err(e) = sink.send(msg).await {
                        log::warn!("[colab-session] write pump failed: {e}");
                        *state.lock().unwrap() = SocketState::Closed;
                        let _ = events_tx.send(SessionEvent::TransportLost(e.to_string()));
                        break;
                    }
                }
            })
        };

        let read_task = {
            let state = state.clone();
            let last_activity = last_activity.clone();
            let last_pong = last_pong.clone();
            let correlation = correlation.clone();
            let events_tx = events_tx.clone();
            let outbound_tx = outbound_tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    let frame = match frame {
                        Ok(f) => f,
                        Err(e) => {
                            log::warn!("[colab-session] read pump failed: {e}");
                            *state.lock().unwrap() = SocketState::Closed;
                            let _ = events_tx.send(SessionEvent::TransportLost(e.to_string()));
                            return;
                        }
                    };
                    *last_activity.lock().unwrap() = Instant::now();
                    match frame {
                        Message::Text(text) => {
                            let wire = match WireMessage::decode(&text) {
                                Ok(w) => w,
                                Err(e) => {
                                    log::debug!("[colab-session] dropping malformed frame: {e}");
                                    continue;
                                }
                            };
                            route_incoming(&correlation, &wire);
                        }
                        Message::Ping(payload) => {
                            let _ = outbound_tx.send(Message::Pong(payload)).await;
                        }
                        Message::Pong(_) => {
                            *last_pong.lock().unwrap() = Instant::now();
                        }
                        Message::Close(frame) => {
                            log::info!("[colab-session] kernel closed: {frame:?}");
                            *state.lock().unwrap() = SocketState::Closed;
                            let _ = events_tx.send(SessionEvent::Closed);
                            return;
                        }
                        Message::Binary(_) | Message::Frame(_) => {}
                    }
                }
                *state.lock().unwrap() = SocketState::Closed;
                let _ = events_tx.send(SessionEvent::Closed);
            })
        };

        let keepalive_task = {
            let state = state.clone();
            let outbound_tx = outbound_tx.clone();
            let events_tx = events_tx.clone();
            let last_pong = last_pong.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PING_INTERVAL);
                loop {
                    ticker.tick().await;
                    if *state.lock().unwrap() != SocketState::Open {
                        return;
                    }
                    if outbound_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                    let elapsed = last_pong.lock().unwrap().elapsed();
                    if elapsed > PONG_DEADLINE {
                        log::warn!("[colab-session] missed pong for {elapsed:?}, marking lost");
                        *state.lock().unwrap() = SocketState::Closed;
                        let _ = events_tx.send(SessionEvent::TransportLost(
                            "missed pong deadline".to_string(),
                        ));
                        return;
                    }
                }
            })
        };

        KernelSession {
            session_id,
            kernel_id,
            path,
            assignment,
            proxy,
            state,
            last_activity,
            outbound: outbound_tx,
            correlation,
            events: events_tx,
            busy: tokio::sync::Mutex::new(()),
            _read_task: read_task,
            _write_task: write_task,
            _keepalive_task: keepalive_task,
        }
    }

    pub fn state(&self) -> SocketState {
        *self.state.lock().unwrap()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Non-blocking acquire of the per-session execution gate. `None` means
    /// another execution is already in flight (spec §4.G `Busy`).
    pub fn try_acquire_busy(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.busy.try_lock().ok()
    }

    /// Registers a correlation slot for `msg_id` and returns the receiver
    /// the dispatcher polls until the terminal reply arrives.
    pub fn register_correlation(&self, msg_id: &str) -> mpsc::UnboundedReceiver<IncomingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.correlation.lock().unwrap().insert(msg_id.to_string(), tx);
        rx
    }

    pub fn unregister_correlation(&self, msg_id: &str) {
        self.correlation.lock().unwrap().remove(msg_id);
    }

    /// Enqueues a message on the write pump. Blocks (applying backpressure)
    /// if the outbound queue is full, per spec §5.
    pub async fn send(&self, msg: &WireMessage) -> Result<()> {
        let text = msg.encode().map_err(|e| RuntimeError::ProtocolError(e.to_string()))?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| RuntimeError::TransportLost {
                reason: "outbound queue closed".to_string(),
            })
    }

    /// Drains the outbound queue for up to 1s, then closes (spec §5
    /// cancellation: "each session drains its write queue up to 1s, then
    /// closes").
    pub async fn close(&self, reason: &str) {
        *self.state.lock().unwrap() = SocketState::Closing;
        tokio::time::sleep(DRAIN_GRACE).await;
        *self.state.lock().unwrap() = SocketState::Closed;
        log::info!("[colab-session] closing session {}: {reason}", self.session_id);
        let _ = self.events.send(SessionEvent::Closed);
    }
}

fn route_incoming(correlation: &CorrelationTable, wire: &WireMessage) {
    let Some(parent_id) = wire.parent_msg_id() else {
        return;
    };
    let classified = jupyter_codec::classify(wire);
    if matches!(classified, IncomingMessage::Other { .. }) {
        return;
    }
    let table = correlation.lock().unwrap();
    if let Some(sender) = table.get(parent_id) {
        let _ = sender.send(classified);
    }
}

/// Scripted fake transport for tests that exercise `dispatcher::execute`
/// without a live WebSocket, per the seam named in the test tooling section:
/// a channel-backed fake standing in for `KernelTransport`.
#[cfg(test)]
pub(crate) mod test_support {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures::channel::mpsc as fmpsc;
    use futures::{Sink, Stream};

    use super::*;
    use crate::types::{MachineShape, Variant};

    /// One leg of a fake kernel connection: a `Sink`/`Stream` pair backed by
    /// unbounded channels instead of a socket.
    pub(crate) struct FakeTransport {
        inbound: fmpsc::UnboundedReceiver<Message>,
        outbound: fmpsc::UnboundedSender<Message>,
    }

    impl Stream for FakeTransport {
        type Item = std::result::Result<Message, WsError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inbound).poll_next(cx).map(|opt| opt.map(Ok))
        }
    }

    impl Sink<Message> for FakeTransport {
        type Error = WsError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Pin::new(&mut self.outbound)
                .poll_ready(cx)
                .map_err(|_| WsError::AlreadyClosed)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> std::result::Result<(), Self::Error> {
            Pin::new(&mut self.outbound)
                .start_send(item)
                .map_err(|_| WsError::AlreadyClosed)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Pin::new(&mut self.outbound)
                .poll_flush(cx)
                .map_err(|_| WsError::AlreadyClosed)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
            Pin::new(&mut self.outbound)
                .poll_close(cx)
                .map_err(|_| WsError::AlreadyClosed)
        }
    }

    /// The test's handle onto the other side of a `fake_session`: frames the
    /// session sent arrive on `to_session`, and frames pushed into
    /// `from_session` are delivered to the session's read pump.
    pub(crate) struct FakeKernelLink {
        pub(crate) to_session: fmpsc::UnboundedReceiver<Message>,
        pub(crate) from_session: fmpsc::UnboundedSender<Message>,
    }

    pub(crate) fn sample_assignment() -> Assignment {
        Assignment {
            label: "test".to_string(),
            endpoint: "https://backend.example".to_string(),
            accelerator: "NONE".to_string(),
            variant: Variant::Default,
            machine_shape: MachineShape::Standard,
            subscription_state: "ACTIVE".to_string(),
            subscription_tier: crate::types::SubscriptionTier::None,
            idle_timeout_sec: None,
        }
    }

    pub(crate) fn sample_proxy() -> ProxyInfo {
        ProxyInfo {
            url: "https://proxy.example".to_string(),
            token: "proxy-token".to_string(),
            issued_at: chrono::Utc::now(),
            ttl_seconds: 3600,
            fetched_at: std::time::Instant::now(),
        }
    }

    /// Builds a `KernelSession` wired to an in-process fake instead of a
    /// live WebSocket, and the test-side handle for driving it.
    pub(crate) fn fake_session(assignment: Assignment, proxy: ProxyInfo) -> (KernelSession, FakeKernelLink) {
        let (session_out_tx, session_out_rx) = fmpsc::unbounded::<Message>();
        let (test_in_tx, session_in_rx) = fmpsc::unbounded::<Message>();

        let transport = FakeTransport {
            inbound: session_in_rx,
            outbound: session_out_tx,
        };

        let session = KernelSession::from_transport(
            "sess-test".to_string(),
            "kernel-test".to_string(),
            "/notebook.ipynb".to_string(),
            assignment,
            proxy,
            transport,
        );

        (
            session,
            FakeKernelLink {
                to_session: session_out_rx,
                from_session: test_in_tx,
            },
        )
    }
}
