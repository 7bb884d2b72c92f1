//! `AccessTokenSource`, the OAuth collaborator named in spec §6. The core
//! only ever calls `get`; acquiring and refreshing the token is entirely the
//! collaborator's concern (spec §1 Out of scope).

use async_trait::async_trait;

/// Supplies a bearer token for Colab REST calls, refreshing as needed.
///
/// Implementations are expected to coalesce concurrent refreshes under a
/// mutex themselves (spec §5: "same at-most-one-in-flight contract as
/// proxy"); this crate does not wrap callers in its own lock since it has no
/// way to distinguish a cheap cached read from an expensive refresh.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn get(&self, force_refresh: bool) -> crate::error::Result<String>;
}

/// A fixed-token source for local development and tests. Not a real OAuth
/// implementation (explicitly out of scope per spec §1); useful for driving
/// `colab-runtime` against a mock or a manually obtained token.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenSource { token: token.into() }
    }

    /// Reads the token from `COLAB_ACCESS_TOKEN`, for `colab auth` in the
    /// absence of a real OAuth flow.
    pub fn from_env() -> crate::error::Result<Self> {
        std::env::var("COLAB_ACCESS_TOKEN")
            .map(StaticTokenSource::new)
            .map_err(|_| {
                crate::error::RuntimeError::Other(
                    "COLAB_ACCESS_TOKEN is not set; no OAuth source is wired up".to_string(),
                )
            })
    }
}

#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn get(&self, _force_refresh: bool) -> crate::error::Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_returns_fixed_token() {
        let source = StaticTokenSource::new("abc123");
        assert_eq!(source.get(false).await.unwrap(), "abc123");
        assert_eq!(source.get(true).await.unwrap(), "abc123");
    }
}
