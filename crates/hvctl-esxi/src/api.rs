//! Client-side contract of the remote management endpoint.
//!
//! One implementation instance serves one [`crate::types::Endpoint`]; the
//! session manager owns the token it hands back from `login`.

use crate::error::EsxiResult;
use crate::types::{ObjectKind, ObjectRef, PropertyMap, SessionToken, VmCreateSpec};

use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Authenticate and open a session.
    async fn login(&self) -> EsxiResult<SessionToken>;

    /// Close a session. Best effort: the session may already be gone.
    async fn logout(&self, token: &SessionToken) -> EsxiResult<()>;

    /// Whether the session is still accepted by the endpoint.
    async fn check_session(&self, token: &SessionToken) -> EsxiResult<bool>;

    /// Every host the endpoint manages (exactly one on bare ESXi).
    async fn list_hosts(&self, token: &SessionToken) -> EsxiResult<Vec<ObjectRef>>;

    /// Fetch the listed property paths of one object.
    async fn retrieve_properties(
        &self,
        token: &SessionToken,
        reference: &ObjectRef,
        attributes: &[String],
    ) -> EsxiResult<PropertyMap>;

    /// Objects of `kind` below `parent`.
    async fn list_children(
        &self,
        token: &SessionToken,
        parent: &ObjectRef,
        kind: &ObjectKind,
    ) -> EsxiResult<Vec<ObjectRef>>;

    /// Create a VM and wait for the creation task to finish.
    async fn create_vm(
        &self,
        token: &SessionToken,
        spec: &VmCreateSpec,
    ) -> EsxiResult<ObjectRef>;
}
