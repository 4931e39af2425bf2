//! ACL checks for topics and subscriptions.

use ferry_core::{AclResource, Principal};
use tracing::debug;

use crate::{
    context::DeliveryContext,
    error::{DeliveryError, Result},
};

/// Authorizes principals against resource ACLs held in storage.
#[derive(Clone)]
pub struct AccessControl {
    context: DeliveryContext,
}

impl AccessControl {
    /// Creates an access checker over the shared collaborators.
    pub fn new(context: DeliveryContext) -> Self {
        Self { context }
    }

    /// Succeeds when `principal` appears on the resource's ACL.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Unauthorized` when it does not,
    /// `DeliveryError::NotFound` when the resource does not exist, and a
    /// storage error when the ACL cannot be read.
    pub async fn ensure_authorized(
        &self,
        principal: &Principal,
        resource: AclResource,
    ) -> Result<()> {
        let acl = self.context.store.load_acl(resource.clone()).await?;

        if acl.iter().any(|identity| *identity == principal.0) {
            return Ok(());
        }

        debug!(principal = %principal, resource = %resource, "access denied");
        Err(DeliveryError::Unauthorized {
            principal: principal.to_string(),
            resource: resource.to_string(),
        })
    }
}
