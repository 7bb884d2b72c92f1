//! `DriveClient`, the notebook CRUD collaborator named in spec §6. Out of
//! scope for this crate (spec §1); only the seam the façade calls through
//! when a caller opens a notebook by Drive path lives here.

use async_trait::async_trait;

/// Minimal notebook metadata returned by Drive lookups.
#[derive(Debug, Clone)]
pub struct DriveNotebook {
    pub file_id: String,
    pub name: String,
}

/// Notebook CRUD against Google Drive. Not implemented by this crate; a real
/// implementation lives in the surrounding repository's Drive client.
#[async_trait]
pub trait DriveClient: Send + Sync {
    async fn resolve_path(&self, path: &str) -> crate::error::Result<DriveNotebook>;
}
