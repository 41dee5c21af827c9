//! Permission gate consulted before every call.

use corral_types::Origin;

/// Decides whether `origin` may invoke `method` on a job.
pub trait PermissionGate: Send + Sync {
    fn is_allowed(&self, origin: &Origin, method: &str) -> bool;
}

/// Permits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn is_allowed(&self, _origin: &Origin, _method: &str) -> bool {
        true
    }
}

impl<F> PermissionGate for F
where
    F: Fn(&Origin, &str) -> bool + Send + Sync,
{
    fn is_allowed(&self, origin: &Origin, method: &str) -> bool {
        self(origin, method)
    }
}
