//! §4.I Runtime manager: the façade wiring assignment negotiation, the
//! proxy token cache, kernel sessions, and the execution dispatcher
//! together, and the only place that talks to the history store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use colab_history::{HistoryEntry, HistoryStore, Mode, RuntimeRef};
use tokio::sync::Mutex;

use crate::assignment::{AssignRequest, AssignmentNegotiator};
use crate::colab_api::ColabApiClient;
use crate::dispatcher::{self, CancelHandle, ExecuteOptions, ExecutionResult};
use crate::error::Result;
use crate::proxy_cache::ProxyTokenCache;
use crate::session::KernelSession;
use crate::types::{Assignment, SocketState};

const DEFAULT_KERNEL_NAME: &str = "python3";

/// Owns at most one live `KernelSession` per endpoint (spec §4.I) and
/// drives the assign -> connect -> execute -> record pipeline end to end.
pub struct RuntimeManager {
    client: ColabApiClient,
    proxy_cache: ProxyTokenCache,
    history: HistoryStore,
    sessions: Mutex<HashMap<String, Arc<KernelSession>>>,
}

impl RuntimeManager {
    pub fn new(client: ColabApiClient, history: HistoryStore) -> Self {
        RuntimeManager {
            client,
            proxy_cache: ProxyTokenCache::new(),
            history,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Spec §4.D via the negotiator.
    pub async fn assign(&self, request: &AssignRequest) -> Result<Assignment> {
        AssignmentNegotiator::new(&self.client).assign_runtime(request).await
    }

    /// Spec §4.C + §4.F: reuse an open session for `assignment.endpoint` if
    /// one exists, otherwise refresh the proxy token and connect.
    pub async fn connect(
        &self,
        assignment: &Assignment,
        path: &str,
        kernel_name: Option<&str>,
    ) -> Result<Arc<KernelSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&assignment.endpoint) {
            if existing.state() == SocketState::Open {
                return Ok(existing.clone());
            }
            sessions.remove(&assignment.endpoint);
        }

        let proxy = self.proxy_cache.get(&self.client, &assignment.endpoint).await?;
        let session = KernelSession::connect(
            &self.client,
            assignment.clone(),
            proxy,
            path,
            kernel_name.unwrap_or(DEFAULT_KERNEL_NAME),
        )
        .await?;
        let session = Arc::new(session);
        sessions.insert(assignment.endpoint.clone(), session.clone());
        Ok(session)
    }

    /// Spec §4.G/§4.H: run `code` on `session`, then record the outcome in
    /// the history store regardless of status.
    pub async fn execute(
        &self,
        session: &KernelSession,
        code: &str,
        opts: ExecuteOptions,
        cancel: Option<CancelHandle>,
    ) -> Result<ExecutionResult> {
        let result = dispatcher::execute(session, code, opts, cancel).await?;
        self.record(session, code, &result).await;
        Ok(result)
    }

    async fn record(&self, session: &KernelSession, code: &str, result: &ExecutionResult) {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            command: code.to_string(),
            mode: Mode::Kernel,
            status: result.status,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            traceback: result.traceback.clone(),
            execution_count: result.execution_count,
            runtime: RuntimeRef {
                label: session.assignment.label.clone(),
                accelerator: session.assignment.accelerator.clone(),
            },
            error_code: result.error_code,
            error: result.error.clone(),
            category: colab_history::category_for_code(result.error_code),
        };
        if let Err(e) = self.history.append(entry).await {
            log::warn!("[manager] failed to append history entry: {e}");
        }
    }

    /// Closes and forgets the session for `endpoint`, if any (spec §5
    /// cancellation semantics: drain up to 1s, then close).
    pub async fn disconnect(&self, endpoint: &str, reason: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(endpoint) {
            session.close(reason).await;
        }
    }

    /// Shuts down every live session, e.g. on Ctrl+C (SPEC_FULL graceful
    /// shutdown supplement).
    pub async fn shutdown(&self, reason: &str) {
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            session.close(reason).await;
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }
}
