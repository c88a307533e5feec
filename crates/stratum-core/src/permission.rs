use crate::session::Session;

/// Decides whether a session holds a permission tag declared on a layer
/// operation.
pub trait PermissionAuthority: Send + Sync {
    fn check(&self, session: &Session, layer_type: &str, permission: &str) -> bool;
}

/// Default authority: a permission is held when the session was granted it
/// (system sessions hold every permission).
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionPermissions;

impl PermissionAuthority for SessionPermissions {
    fn check(&self, session: &Session, _layer_type: &str, permission: &str) -> bool {
        session.has_permission(permission)
    }
}
