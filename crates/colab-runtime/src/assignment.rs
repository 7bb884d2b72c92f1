//! §4.D Assignment negotiator: picks or creates a compute assignment given
//! variant preferences and existing runtimes.

use crate::colab_api::{ColabApiClient, PostAssignmentOutcome};
use crate::error::{Result, RuntimeError};
use crate::types::{Assignment, Variant};

#[derive(Debug, Clone, Default)]
pub struct AssignRequest {
    pub force_new: bool,
    pub variant: Option<Variant>,
}

pub struct AssignmentNegotiator<'a> {
    client: &'a ColabApiClient,
}

impl<'a> AssignmentNegotiator<'a> {
    pub fn new(client: &'a ColabApiClient) -> Self {
        AssignmentNegotiator { client }
    }

    /// Spec §4.D policy:
    /// 1. If not forcing a new assignment, reuse the first existing one
    ///    matching `variant` (or any, if unset).
    /// 2. Otherwise `postAssignment` and translate `outcome`.
    pub async fn assign_runtime(&self, request: &AssignRequest) -> Result<Assignment> {
        if !request.force_new {
            let existing = self.client.list_assignments().await?;
            if let Some(found) = existing.into_iter().find(|a| match request.variant {
                Some(variant) => a.variant == variant,
                None => true,
            }) {
                log::info!("[assignment] reusing existing assignment {}", found.label);
                return Ok(found);
            }
        }

        match self
            .client
            .post_assignment(request.variant, request.force_new)
            .await?
        {
            PostAssignmentOutcome::Success(assignment, _proxy) => {
                log::info!("[assignment] created assignment {}", assignment.label);
                Ok(assignment)
            }
            PostAssignmentOutcome::QuotaDenied => Err(RuntimeError::QuotaDenied {
                variant: request.variant.unwrap_or(Variant::Default),
            }),
            PostAssignmentOutcome::QuotaExceeded => Err(RuntimeError::QuotaExceeded),
            PostAssignmentOutcome::Denylisted => Err(RuntimeError::Denylisted),
            PostAssignmentOutcome::Other(outcome) => Err(RuntimeError::AssignmentFailed {
                outcome: format!("{outcome:?}"),
            }),
        }
    }
}
