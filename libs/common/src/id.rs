use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = fitra_common::id::prefixed_ulid("sub");
/// assert!(id.starts_with("sub_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Prefixes for ids the client mints on the bus.
pub mod prefix {
    /// STOMP subscription ids.
    pub const SUBSCRIPTION: &str = "sub";
    /// `receipt` header values for acknowledged publishes.
    pub const RECEIPT: &str = "rcpt";
    /// Fallback session id when CONNECTED carries no `session` header.
    pub const SESSION: &str = "ses";
}
