//! §4.B Colab API client: typed wrappers over assignment/proxy/kernel/
//! session endpoints, with token-aware retry for transient upstream
//! failures (spec §7).
//!
//! Grounded on the `JupyterClient` REST method shape from the
//! `ananis25-jute`/`ekzhang-jute` examples (one method per endpoint,
//! `reqwest` + `error_for_status`); enum normalization is original, closed
//! over the wire shapes in `types.rs`.

use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::http::HttpTransport;
use crate::types::{
    normalize_machine_shape, normalize_outcome, normalize_subscription_tier_numeric,
    normalize_subscription_tier_string, normalize_variant, Assignment, MachineShape, Outcome,
    ProxyInfo, SubscriptionTier, Variant,
};

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(8);
const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Raw `runtimeProxyInfo` wire shape.
#[derive(Debug, Clone, Deserialize)]
struct RuntimeProxyInfoWire {
    url: String,
    token: String,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AssignmentWire {
    label: String,
    endpoint: String,
    #[serde(default)]
    accelerator: Option<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    machine_shape: Option<String>,
    #[serde(default)]
    subscription_state: Option<String>,
    /// Numeric `ColabSubscriptionTier` encoding.
    #[serde(default)]
    subscription_tier: Option<i64>,
    /// String `ColabGapiSubscriptionTier` encoding; present instead of
    /// `subscription_tier` on some endpoints.
    #[serde(default)]
    gapi_subscription_tier: Option<String>,
    #[serde(default)]
    idle_timeout_sec: Option<u64>,
    #[serde(default)]
    runtime_proxy_info: Option<RuntimeProxyInfoWire>,
}

impl AssignmentWire {
    fn tier(&self) -> SubscriptionTier {
        if let Some(s) = &self.gapi_subscription_tier {
            normalize_subscription_tier_string(s)
        } else if let Some(n) = self.subscription_tier {
            normalize_subscription_tier_numeric(n)
        } else {
            SubscriptionTier::None
        }
    }

    fn into_assignment(self) -> Assignment {
        Assignment {
            label: self.label,
            endpoint: self.endpoint,
            accelerator: self.accelerator.clone().unwrap_or_default(),
            variant: self
                .variant
                .as_deref()
                .map(normalize_variant)
                .unwrap_or(Variant::Default),
            machine_shape: self
                .machine_shape
                .as_deref()
                .map(normalize_machine_shape)
                .unwrap_or(MachineShape::Standard),
            subscription_state: self.subscription_state.clone().unwrap_or_default(),
            subscription_tier: self.tier(),
            idle_timeout_sec: self.idle_timeout_sec,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListAssignmentsResponse {
    #[serde(default)]
    assignments: Vec<AssignmentWire>,
}

#[derive(Debug, Serialize)]
struct PostAssignmentBody {
    variant: Option<Variant>,
    force_new: bool,
}

#[derive(Debug, Deserialize)]
struct PostAssignmentResponse {
    outcome: String,
    #[serde(flatten)]
    assignment: AssignmentWire,
}

#[derive(Debug, Deserialize)]
pub struct CcuInfo {
    pub compute_units_remaining: f64,
    /// Total system RAM available to the current assignment, if one is
    /// live. Backs the `colab status` memory gauge (spec §8 boundary
    /// behaviors: `formatMemory`/`calculateMemoryUsage`).
    #[serde(default)]
    pub ram_total_mb: Option<u64>,
    /// Fraction of `ram_total_mb` currently in use, in `[0.0, 1.0]`.
    #[serde(default)]
    pub ram_usage_fraction: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct UserInfo {
    pub email: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct KernelInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JupyterSessionInfo {
    pub id: String,
    pub kernel: KernelInfo,
    pub path: String,
}

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    path: &'a str,
    kernel: CreateSessionKernel<'a>,
    #[serde(rename = "type")]
    type_: &'static str,
}

#[derive(Debug, Serialize)]
struct CreateSessionKernel<'a> {
    name: &'a str,
}

/// Result of `postAssignment`, distinguishing the one success path from
/// the four named failure outcomes in spec §4.D.
pub enum PostAssignmentOutcome {
    Success(Assignment, ProxyInfo),
    QuotaDenied,
    QuotaExceeded,
    Denylisted,
    Other(Outcome),
}

pub struct ColabApiClient {
    transport: HttpTransport,
    api_domain: String,
    gapi_domain: String,
}

impl ColabApiClient {
    pub fn new(transport: HttpTransport, api_domain: String, gapi_domain: String) -> Self {
        ColabApiClient {
            transport,
            api_domain,
            gapi_domain,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("https://{}{}", self.api_domain, path)
    }

    fn gapi_url(&self, path: &str) -> String {
        format!("https://{}{}", self.gapi_domain, path)
    }

    /// Retries 429/5xx with exponential backoff (base 500ms, cap 8s, max 3
    /// attempts); any other error, or a non-transient status, is fatal
    /// immediately (spec §7).
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(RuntimeError::HttpError { status, status_text, body_text })
                    if attempt < RETRY_MAX_ATTEMPTS && (status == 429 || status >= 500) =>
                {
                    let delay = RETRY_BASE
                        .saturating_mul(1u32 << (attempt - 1))
                        .min(RETRY_CAP);
                    log::warn!(
                        "[colab-api] retryable http {status} ({status_text}), attempt {attempt}/{RETRY_MAX_ATTEMPTS}, backing off {delay:?}"
                    );
                    let _ = body_text;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_ccu_info(&self) -> Result<CcuInfo> {
        self.with_retry(|| async {
            self.transport
                .request(Method::GET, &self.api_url("/tun/m/ccu"), None::<&()>)
                .await
        })
        .await
    }

    pub async fn get_user_info(&self) -> Result<UserInfo> {
        self.with_retry(|| async {
            self.transport
                .request(Method::GET, &self.gapi_url("/userinfo/v2/me"), None::<&()>)
                .await
        })
        .await
    }

    pub async fn list_assignments(&self) -> Result<Vec<Assignment>> {
        let resp: ListAssignmentsResponse = self
            .with_retry(|| async {
                self.transport
                    .request(Method::GET, &self.api_url("/tun/m/assignments"), None::<&()>)
                    .await
            })
            .await?;
        Ok(resp.assignments.into_iter().map(AssignmentWire::into_assignment).collect())
    }

    pub async fn post_assignment(
        &self,
        variant: Option<Variant>,
        force_new: bool,
    ) -> Result<PostAssignmentOutcome> {
        let body = PostAssignmentBody { variant, force_new };
        let resp: PostAssignmentResponse = self
            .with_retry(|| async {
                self.transport
                    .request(Method::POST, &self.api_url("/tun/m/assign"), Some(&body))
                    .await
            })
            .await?;

        let outcome = normalize_outcome(&resp.outcome);
        Ok(match outcome {
            Outcome::Success => {
                let proxy_wire = resp.assignment.runtime_proxy_info.clone();
                let assignment = resp.assignment.into_assignment();
                match proxy_wire {
                    Some(wire) => {
                        let proxy = ProxyInfo {
                            url: wire.url,
                            token: wire.token,
                            issued_at: chrono::Utc::now(),
                            ttl_seconds: wire.ttl_seconds.unwrap_or(3600),
                            fetched_at: std::time::Instant::now(),
                        };
                        PostAssignmentOutcome::Success(assignment, proxy)
                    }
                    // Spec §4.D step 3 / §9 Open Question 1: a missing
                    // `runtimeProxyInfo` is treated as an assignment
                    // failure, not recoverable elsewhere.
                    None => return Err(RuntimeError::MissingProxyInfo),
                }
            }
            Outcome::QuotaDeniedRequestedVariants => PostAssignmentOutcome::QuotaDenied,
            Outcome::QuotaExceededUsageTime => PostAssignmentOutcome::QuotaExceeded,
            Outcome::Denylisted => PostAssignmentOutcome::Denylisted,
            Outcome::UndefinedOutcome => PostAssignmentOutcome::Other(outcome),
        })
    }

    pub async fn refresh_connection(&self, endpoint: &str) -> Result<ProxyInfo> {
        let wire: RuntimeProxyInfoWire = self
            .with_retry(|| async {
                self.transport
                    .request(
                        Method::POST,
                        &self.api_url(&format!("/tun/m/connect/{endpoint}")),
                        None::<&()>,
                    )
                    .await
            })
            .await?;
        Ok(ProxyInfo {
            url: wire.url,
            token: wire.token,
            issued_at: chrono::Utc::now(),
            ttl_seconds: wire.ttl_seconds.unwrap_or(3600),
            fetched_at: std::time::Instant::now(),
        })
    }

    pub async fn list_kernels(&self, proxy: &ProxyInfo) -> Result<Vec<KernelInfo>> {
        self.with_retry(|| async {
            self.transport
                .request(
                    Method::GET,
                    &format!("{}/api/kernels?token={}", proxy.url, proxy.token),
                    None::<&()>,
                )
                .await
        })
        .await
    }

    pub async fn list_sessions(&self, proxy: &ProxyInfo) -> Result<Vec<JupyterSessionInfo>> {
        self.with_retry(|| async {
            self.transport
                .request(
                    Method::GET,
                    &format!("{}/api/sessions?token={}", proxy.url, proxy.token),
                    None::<&()>,
                )
                .await
        })
        .await
    }

    pub async fn create_session(
        &self,
        proxy: &ProxyInfo,
        path: &str,
        kernel_name: &str,
    ) -> Result<JupyterSessionInfo> {
        let body = CreateSessionBody {
            path,
            kernel: CreateSessionKernel { name: kernel_name },
            type_: "notebook",
        };
        self.with_retry(|| async {
            self.transport
                .request(
                    Method::POST,
                    &format!("{}/api/sessions?token={}", proxy.url, proxy.token),
                    Some(&body),
                )
                .await
        })
        .await
    }

    pub async fn delete_session(&self, proxy: &ProxyInfo, session_id: &str) -> Result<()> {
        self.with_retry(|| async {
            self.transport
                .request_unit(
                    Method::DELETE,
                    &format!("{}/api/sessions/{session_id}?token={}", proxy.url, proxy.token),
                    None::<&()>,
                )
                .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_wire_prefers_gapi_string_tier_over_numeric() {
        let wire = AssignmentWire {
            label: "l".into(),
            endpoint: "e".into(),
            accelerator: None,
            variant: Some("GPU".into()),
            machine_shape: None,
            subscription_state: None,
            subscription_tier: Some(1),
            gapi_subscription_tier: Some("COLAB_PRO_PLUS".into()),
            idle_timeout_sec: None,
            runtime_proxy_info: None,
        };
        assert_eq!(wire.tier(), SubscriptionTier::ProPlus);
    }

    #[test]
    fn assignment_wire_falls_back_to_numeric_tier() {
        let wire = AssignmentWire {
            label: "l".into(),
            endpoint: "e".into(),
            accelerator: None,
            variant: None,
            machine_shape: None,
            subscription_state: None,
            subscription_tier: Some(2),
            gapi_subscription_tier: None,
            idle_timeout_sec: None,
            runtime_proxy_info: None,
        };
        assert_eq!(wire.tier(), SubscriptionTier::ProPlus);
        assert_eq!(wire.into_assignment().variant, Variant::Default);
    }
}
