//! §4.G Execution dispatcher: issues `execute_request`, aggregates the
//! iopub/shell reply stream into one `ExecutionResult`, and enforces
//! timeouts/cancellation. Never returns an `Err` for an execution outcome
//! (spec §7) — only `Busy` is surfaced as a setup failure before a
//! `PendingExecution` exists.

use std::time::{Duration, Instant};

use colab_history::{error_code, ErrorDetail, Status};
use tokio::sync::Notify;

use crate::error::{Result, RuntimeError};
use crate::jupyter_codec::{self, ExecReplyStatus, IncomingMessage, StreamName};
use crate::session::{KernelSession, SessionEvent};

const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout_ms: Option<u64>,
    pub silent: bool,
}

/// Cooperative cancellation for an in-flight `execute`. `cancel()` may be
/// called from any task; `execute` observes it via `cancelled()`.
#[derive(Clone)]
pub struct CancelHandle {
    notify: std::sync::Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        CancelHandle {
            notify: std::sync::Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.notify.notify_waiters();
    }

    async fn cancelled(&self) {
        self.notify.notified().await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionTiming {
    pub connection_ms: u64,
    pub execution_ms: u64,
    pub cleanup_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
    pub traceback: Vec<String>,
    pub display_data: Vec<serde_json::Value>,
    pub execution_count: Option<i64>,
    pub error: Option<ErrorDetail>,
    pub error_code: i32,
    pub timing: Option<ExecutionTiming>,
}

#[derive(Debug, Default)]
struct OutputBuffer {
    stdout: String,
    stderr: String,
    traceback: Vec<String>,
    display_data: Vec<serde_json::Value>,
    execution_count: Option<i64>,
    error: Option<ErrorDetail>,
}

impl OutputBuffer {
    fn apply(&mut self, msg: IncomingMessage) -> Option<(Status, i32)> {
        match msg {
            IncomingMessage::Stream { name, text, .. } => {
                match name {
                    StreamName::Stdout => self.stdout.push_str(&text),
                    StreamName::Stderr => self.stderr.push_str(&text),
                }
                None
            }
            IncomingMessage::DisplayData { data, .. } | IncomingMessage::ExecuteResult { data, .. } => {
                self.display_data.push(data);
                None
            }
            IncomingMessage::Error { ename, evalue, traceback, .. } => {
                self.traceback = traceback.clone();
                self.error = Some(ErrorDetail { ename, evalue, traceback });
                None
            }
            IncomingMessage::ExecuteReply { status, execution_count, .. } => {
                self.execution_count = execution_count;
                let (status, code) = match status {
                    ExecReplyStatus::Ok => (Status::Ok, error_code::NONE),
                    ExecReplyStatus::Error => (Status::Error, error_code::RUNTIME_START),
                    ExecReplyStatus::Abort => (Status::Abort, error_code::CANCELED),
                };
                Some((status, code))
            }
            IncomingMessage::Status { .. } | IncomingMessage::Other { .. } => None,
        }
    }

    fn into_result(self, status: Status, error_code: i32, timing: ExecutionTiming) -> ExecutionResult {
        ExecutionResult {
            status,
            stdout: self.stdout,
            stderr: self.stderr,
            traceback: self.traceback,
            display_data: self.display_data,
            execution_count: self.execution_count,
            error: self.error,
            error_code,
            timing: Some(timing),
        }
    }
}

/// Spec §4.G `execute`: the per-session busy gate lives on `KernelSession`
/// (`try_lock` is the "reject, don't wait" serialization the spec calls
/// for); this function owns the rest of the protocol.
pub async fn execute(
    session: &KernelSession,
    code: &str,
    opts: ExecuteOptions,
    cancel: Option<CancelHandle>,
) -> Result<ExecutionResult> {
    let _busy_guard = session.try_acquire_busy().ok_or(RuntimeError::Busy)?;

    let started = Instant::now();
    let request = jupyter_codec::execute_request(&session.session_id, code, opts.silent);
    let msg_id = request.header.msg_id.clone();
    let mut replies = session.register_correlation(&msg_id);
    let mut events = session.subscribe_events();

    if let Err(e) = session.send(&request).await {
        session.unregister_correlation(&msg_id);
        log::warn!("[dispatcher] failed to send execute_request: {e}");
        return Ok(transport_lost_result(started));
    }

    let mut buffer = OutputBuffer::default();

    let timeout_sleep = async {
        match opts.timeout_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timeout_sleep);

    let cancel_wait = async {
        match &cancel {
            Some(c) => c.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(cancel_wait);

    let terminal = loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                if let Ok(SessionEvent::TransportLost(reason)) = event {
                    log::warn!("[dispatcher] transport lost mid-execution: {reason}");
                    session.unregister_correlation(&msg_id);
                    return Ok(transport_lost_result(started));
                }
            }
            _ = &mut timeout_sleep => {
                break grace_and_abort(session, &mut replies, &mut buffer, error_code::TIMEOUT).await;
            }
            _ = &mut cancel_wait => {
                break grace_and_abort(session, &mut replies, &mut buffer, error_code::CANCELED).await;
            }
            incoming = replies.recv() => {
                match incoming {
                    Some(msg) => {
                        if let Some((status, code)) = buffer.apply(msg) {
                            break (status, code);
                        }
                    }
                    None => {
                        // Correlation channel closed without a terminal reply:
                        // treat as transport loss rather than hang forever.
                        session.unregister_correlation(&msg_id);
                        return Ok(transport_lost_result(started));
                    }
                }
            }
        }
    };

    session.unregister_correlation(&msg_id);
    let timing = ExecutionTiming {
        connection_ms: 0,
        execution_ms: started.elapsed().as_millis() as u64,
        cleanup_ms: 0,
    };
    Ok(buffer.into_result(terminal.0, terminal.1, timing))
}

fn transport_lost_result(started: Instant) -> ExecutionResult {
    ExecutionResult {
        status: Status::Error,
        stdout: String::new(),
        stderr: String::new(),
        traceback: Vec::new(),
        display_data: Vec::new(),
        execution_count: None,
        error: None,
        error_code: error_code::TRANSPORT,
        timing: Some(ExecutionTiming {
            connection_ms: 0,
            execution_ms: started.elapsed().as_millis() as u64,
            cleanup_ms: 0,
        }),
    }
}

/// Spec §4.G step 5: send `interrupt_request`, wait up to 2s for a reply to
/// settle. If a terminal `execute_reply` arrives within the grace window,
/// its actual status/code wins; only "with no `execute_reply`" (grace timer
/// elapses, or the channel closes) forces `ABORT` with the given code.
async fn grace_and_abort(
    session: &KernelSession,
    replies: &mut tokio::sync::mpsc::UnboundedReceiver<IncomingMessage>,
    buffer: &mut OutputBuffer,
    code: i32,
) -> (Status, i32) {
    let interrupt = jupyter_codec::interrupt_request(&session.session_id);
    if let Err(e) = session.send(&interrupt).await {
        log::warn!("[dispatcher] failed to send interrupt_request: {e}");
    }
    let grace = tokio::time::sleep(INTERRUPT_GRACE);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            _ = &mut grace => return (Status::Abort, code),
            incoming = replies.recv() => {
                match incoming {
                    Some(msg) => {
                        if let Some(terminal) = buffer.apply(msg) {
                            return terminal;
                        }
                    }
                    None => return (Status::Abort, code),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_output_accumulates_by_name() {
        let mut buffer = OutputBuffer::default();
        buffer.apply(IncomingMessage::Stream {
            parent_msg_id: None,
            name: StreamName::Stdout,
            text: "hi\n".to_string(),
        });
        buffer.apply(IncomingMessage::Stream {
            parent_msg_id: None,
            name: StreamName::Stderr,
            text: "oops\n".to_string(),
        });
        assert_eq!(buffer.stdout, "hi\n");
        assert_eq!(buffer.stderr, "oops\n");
    }

    #[test]
    fn execute_reply_ok_terminates_with_none_error_code() {
        let mut buffer = OutputBuffer::default();
        let terminal = buffer.apply(IncomingMessage::ExecuteReply {
            parent_msg_id: None,
            status: ExecReplyStatus::Ok,
            execution_count: Some(1),
        });
        assert_eq!(terminal, Some((Status::Ok, error_code::NONE)));
        assert_eq!(buffer.execution_count, Some(1));
    }

    #[test]
    fn error_message_populates_error_detail() {
        let mut buffer = OutputBuffer::default();
        buffer.apply(IncomingMessage::Error {
            parent_msg_id: None,
            ename: "ZeroDivisionError".into(),
            evalue: "division by zero".into(),
            traceback: vec!["ZeroDivisionError: division by zero".into()],
        });
        assert!(buffer.error.is_some());
        assert_eq!(buffer.error.unwrap().ename, "ZeroDivisionError");
    }

    // --- Integration tests against the scripted fake transport ------------
    //
    // These drive `execute` end to end over `session::test_support`'s
    // in-process fake instead of a live WebSocket, covering the scenarios in
    // spec §8 that the pure `OutputBuffer::apply` tests above can't reach:
    // busy rejection, timeout/abort, transport loss, and that the busy gate
    // is released exactly once an execution completes.

    use crate::jupyter_codec::{Header, WireMessage};
    use crate::session::test_support::{fake_session, sample_assignment, sample_proxy, FakeKernelLink};
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    async fn next_wire(link: &mut FakeKernelLink) -> WireMessage {
        match link.to_session.next().await.expect("session should send a frame") {
            Message::Text(text) => WireMessage::decode(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    fn send_wire(link: &FakeKernelLink, wire: WireMessage) {
        link.from_session
            .unbounded_send(Message::Text(wire.encode().unwrap()))
            .unwrap();
    }

    #[tokio::test]
    async fn busy_execute_is_rejected_while_one_is_active() {
        let (session, _link) = fake_session(sample_assignment(), sample_proxy());
        let _guard = session.try_acquire_busy().unwrap();

        let result = execute(&session, "1 + 1", ExecuteOptions::default(), None).await;
        assert!(matches!(result, Err(RuntimeError::Busy)));
    }

    #[tokio::test]
    async fn happy_execution_reports_stdout_and_releases_busy_gate() {
        let (session, mut link) = fake_session(sample_assignment(), sample_proxy());

        let server = async {
            let request = next_wire(&mut link).await;
            let parent = request.header.clone();
            send_wire(
                &link,
                WireMessage {
                    header: Header::new("stream", "s"),
                    parent_header: Some(parent.clone()),
                    metadata: serde_json::json!({}),
                    content: serde_json::json!({"name": "stdout", "text": "hi\n"}),
                    buffers: vec![],
                    channel: "iopub".into(),
                },
            );
            send_wire(
                &link,
                WireMessage {
                    header: Header::new("execute_reply", "s"),
                    parent_header: Some(parent),
                    metadata: serde_json::json!({}),
                    content: serde_json::json!({"status": "ok", "execution_count": 1}),
                    buffers: vec![],
                    channel: "shell".into(),
                },
            );
        };

        let (result, _) = tokio::join!(execute(&session, "print('hi')", ExecuteOptions::default(), None), server);
        let result = result.unwrap();
        assert_eq!(result.status, Status::Ok);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.execution_count, Some(1));
        assert_eq!(result.error_code, error_code::NONE);

        // Spec §8 invariant 2 ("OneShot completes exactly once"): the busy
        // gate must be released once `execute` returns.
        assert!(session.try_acquire_busy().is_some());
    }

    #[tokio::test]
    async fn transport_loss_completes_as_error_with_transport_code() {
        let (session, link) = fake_session(sample_assignment(), sample_proxy());
        drop(link.to_session);

        let result = execute(&session, "1 + 1", ExecuteOptions::default(), None).await.unwrap();
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.error_code, error_code::TRANSPORT);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_reply_completes_as_abort_with_timeout_code() {
        let (session, mut link) = fake_session(sample_assignment(), sample_proxy());
        let opts = ExecuteOptions {
            timeout_ms: Some(50),
            silent: false,
        };

        let result = execute(&session, "while True: pass", opts, None).await.unwrap();
        assert_eq!(result.status, Status::Abort);
        assert_eq!(result.error_code, error_code::TIMEOUT);

        let _execute_request = next_wire(&mut link).await;
        let interrupt = next_wire(&mut link).await;
        assert_eq!(interrupt.header.msg_type, "interrupt_request");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_reply_during_grace_window_wins_over_forced_abort() {
        let (session, mut link) = fake_session(sample_assignment(), sample_proxy());
        let opts = ExecuteOptions {
            timeout_ms: Some(50),
            silent: false,
        };

        let server = async {
            let request = next_wire(&mut link).await;
            let parent = request.header.clone();
            let _interrupt = next_wire(&mut link).await;
            send_wire(
                &link,
                WireMessage {
                    header: Header::new("execute_reply", "s"),
                    parent_header: Some(parent),
                    metadata: serde_json::json!({}),
                    content: serde_json::json!({"status": "ok", "execution_count": 7}),
                    buffers: vec![],
                    channel: "shell".into(),
                },
            );
        };

        let (result, _) = tokio::join!(execute(&session, "print(1)", opts, None), server);
        let result = result.unwrap();
        assert_eq!(result.status, Status::Ok);
        assert_eq!(result.error_code, error_code::NONE);
        assert_eq!(result.execution_count, Some(7));
    }
}
