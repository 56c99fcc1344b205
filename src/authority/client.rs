//! The bridge authority contract.

use async_trait::async_trait;

use crate::authority::types::{AuthorityResult, ConfirmationHandle, SignedBatch, SourceConfirmation};

/// Commands and queries against the validating and relaying authority.
///
/// Chain names are the authority's own registry identifiers.
#[async_trait]
pub trait BridgeAuthorityClient: Send + Sync {
    /// Bind `address` as the gateway for `chain`.
    ///
    /// Re-registering the same address succeeds without effect.
    async fn register_gateway(&self, chain: &str, address: &str) -> AuthorityResult<()>;

    /// Ask the authority to validate a source transaction.
    ///
    /// Returns once the request is accepted; confirmation itself is observed
    /// through [`poll_confirmation`](Self::poll_confirmation). A repeated
    /// request fails with `AlreadyConfirmed`.
    async fn confirm_source_event(&self, chain: &str, tx_id: &str) -> AuthorityResult<ConfirmationHandle>;

    /// Read-only status of a confirmation request.
    async fn poll_confirmation(&self, handle: &ConfirmationHandle) -> AuthorityResult<SourceConfirmation>;

    /// Ask for a threshold signature over every pending command for `dest_chain`.
    ///
    /// A no-op when nothing is pending.
    async fn request_command_signing(&self, dest_chain: &str) -> AuthorityResult<()>;

    /// Read-only view of a command batch for `dest_chain`.
    ///
    /// With `command_id`, returns the batch carrying that command when the
    /// authority can look it up, and the latest batch otherwise.
    async fn poll_signed_batch(
        &self,
        dest_chain: &str,
        command_id: Option<&str>,
    ) -> AuthorityResult<SignedBatch>;
}
