//! Core data model (spec §3): assignments, proxy credentials, kernel
//! sessions, and the closed enums normalized from the two wire encodings
//! Colab's APIs use.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Safety margin subtracted from a proxy token's TTL before it's considered
/// stale (spec §3: `safetyMargin >= 30s`).
pub const PROXY_SAFETY_MARGIN: Duration = Duration::from_secs(30);

/// Accelerator class requested for an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Variant {
    Default,
    Gpu,
    Tpu,
}

/// Machine shape of an assignment's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MachineShape {
    Standard,
    Highmem,
}

/// Subscription tier, collapsed from two distinct wire encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionTier {
    None,
    Pro,
    ProPlus,
}

/// Outcome of a `postAssignment` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    UndefinedOutcome,
    QuotaDeniedRequestedVariants,
    QuotaExceededUsageTime,
    Success,
    Denylisted,
}

/// One reserved Colab backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub label: String,
    pub endpoint: String,
    pub accelerator: String,
    pub variant: Variant,
    pub machine_shape: MachineShape,
    pub subscription_state: String,
    pub subscription_tier: SubscriptionTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_sec: Option<u64>,
}

/// Short-lived credential authenticating traffic to an assignment's
/// endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub url: String,
    pub token: String,
    pub issued_at: chrono::DateTime<chrono::Utc>,
    pub ttl_seconds: u64,
    /// Wall-clock instant this was fetched, used for the monotonic expiry
    /// check instead of `issued_at` (which is wire data we don't trust for
    /// timing arithmetic).
    #[serde(skip, default = "Instant::now")]
    pub fetched_at: Instant,
}

impl ProxyInfo {
    /// Spec §3: valid only while `now < issuedAt + ttlSeconds - safetyMargin`.
    pub fn is_valid(&self) -> bool {
        let ttl = Duration::from_secs(self.ttl_seconds);
        match ttl.checked_sub(PROXY_SAFETY_MARGIN) {
            Some(usable) => self.fetched_at.elapsed() < usable,
            None => false,
        }
    }
}

/// Socket lifecycle of a `KernelSession` (spec §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

// --- Enum normalization -----------------------------------------------
//
// Two wire encodings exist for subscription tier: a numeric
// `ColabSubscriptionTier` and a string `ColabGapiSubscriptionTier`. Both
// collapse to the closed `SubscriptionTier` enum here. Variant collapses
// similarly. Each normalizer is total over its input type, so there's no
// silent "unknown" fallthrough to audit.

/// Normalizes the numeric `ColabSubscriptionTier` wire encoding.
pub fn normalize_subscription_tier_numeric(code: i64) -> SubscriptionTier {
    match code {
        1 => SubscriptionTier::Pro,
        2 => SubscriptionTier::ProPlus,
        _ => SubscriptionTier::None,
    }
}

/// Normalizes the string `ColabGapiSubscriptionTier` wire encoding.
pub fn normalize_subscription_tier_string(s: &str) -> SubscriptionTier {
    match s {
        "COLAB_PRO" => SubscriptionTier::Pro,
        "COLAB_PRO_PLUS" => SubscriptionTier::ProPlus,
        _ => SubscriptionTier::None,
    }
}

/// Normalizes the already-closed `SubscriptionTier` enum (identity,
/// provided so every wire shape goes through a `normalize_*` call site and
/// idempotence is checkable uniformly per spec §8 invariant 7).
pub fn normalize_subscription_tier(tier: SubscriptionTier) -> SubscriptionTier {
    tier
}

/// Normalizes the accelerator variant wire encoding.
pub fn normalize_variant(s: &str) -> Variant {
    match s {
        "GPU" => Variant::Gpu,
        "TPU" => Variant::Tpu,
        _ => Variant::Default,
    }
}

/// Normalizes the machine shape wire encoding.
pub fn normalize_machine_shape(s: &str) -> MachineShape {
    match s {
        "HIGHMEM" => MachineShape::Highmem,
        _ => MachineShape::Standard,
    }
}

/// Normalizes the assignment outcome wire encoding.
pub fn normalize_outcome(s: &str) -> Outcome {
    match s {
        "QUOTA_DENIED_REQUESTED_VARIANTS" => Outcome::QuotaDeniedRequestedVariants,
        "QUOTA_EXCEEDED_USAGE_TIME" => Outcome::QuotaExceededUsageTime,
        "SUCCESS" => Outcome::Success,
        "DENYLISTED" => Outcome::Denylisted,
        _ => Outcome::UndefinedOutcome,
    }
}
