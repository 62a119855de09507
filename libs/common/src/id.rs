use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = broker_common::id::prefixed_ulid("ses");
/// assert!(id.starts_with("ses_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Sessions minted by the broker's session providers.
    pub const SESSION: &str = "ses";
    /// Server-assigned client identities.
    pub const CLIENT: &str = "cli";
    /// Messages created on the server (replies, pushes, synthesized commands).
    pub const MESSAGE: &str = "msg";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid("cli");
        assert!(id.starts_with("cli_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 4 + 26);
    }

    #[test]
    fn test_uniqueness() {
        let a = prefixed_ulid("msg");
        let b = prefixed_ulid("msg");
        assert_ne!(a, b);
    }

    #[test]
    fn test_well_known_prefixes_are_distinct() {
        assert_ne!(prefix::SESSION, prefix::CLIENT);
        assert_ne!(prefix::CLIENT, prefix::MESSAGE);
    }
}
