/// Reserved caller identity with cross-owner access.
pub const ADMIN_IDENTITY: &str = "admin";

/// A caller may operate on a task iff it owns the task or is the admin.
pub fn is_authorized(caller: &str, owner: &str) -> bool {
    caller == owner || caller == ADMIN_IDENTITY
}
