//! §4.C Proxy token cache: per-endpoint `ProxyInfo`, refreshed on expiry.
//! Concurrent misses for the same key coalesce into a single network call
//! (spec §8 invariant 6), via a per-key single-flight table shaped like the
//! `pending_history`/`pending_completions` correlation maps in
//! `kernel_manager.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::colab_api::ColabApiClient;
use crate::error::Result;
use crate::types::ProxyInfo;

/// One in-flight-or-cached slot per endpoint. The `Mutex<Option<ProxyInfo>>`
/// doubles as the single-flight lock: the first caller to acquire it for a
/// stale/missing entry holds it for the full refresh, so late arrivals block
/// on the lock rather than issuing their own request.
struct Slot {
    entry: Mutex<Option<ProxyInfo>>,
}

pub struct ProxyTokenCache {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ProxyTokenCache {
    pub fn new() -> Self {
        ProxyTokenCache {
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot_for(&self, endpoint: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    entry: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Returns a valid cached `ProxyInfo`, refreshing via `client` if the
    /// entry is missing or stale.
    pub async fn get(&self, client: &ColabApiClient, endpoint: &str) -> Result<ProxyInfo> {
        let slot = self.slot_for(endpoint).await;
        let mut entry = slot.entry.lock().await;

        if let Some(proxy) = entry.as_ref() {
            if proxy.is_valid() {
                return Ok(proxy.clone());
            }
        }

        log::debug!("[proxy-cache] refreshing proxy token for {endpoint}");
        let fresh = client.refresh_connection(endpoint).await?;
        *entry = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops a cached entry, forcing the next `get` to refresh. Used when a
    /// session discovers its proxy token was rejected out from under it.
    pub async fn invalidate(&self, endpoint: &str) {
        let slots = self.slots.lock().await;
        if let Some(slot) = slots.get(endpoint) {
            *slot.entry.lock().await = None;
        }
    }
}

impl Default for ProxyTokenCache {
    fn default() -> Self {
        Self::new()
    }
}
