//! Session key generation and handling.

/// A key that uniquely identifies a session.
///
/// The key is composed of the group and the raw key being limited
/// (typically a client IP), rendered as `"{group}:{key}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// The group this session belongs to
    pub group: String,
    /// The raw key being rate limited
    pub key: String,
}

impl SessionKey {
    /// Create a new session key from a raw key and a group.
    pub fn new(key: &str, group: &str) -> Self {
        Self {
            group: group.to_string(),
            key: key.to_string(),
        }
    }

    /// Convert the session key to its registry string.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.group, self.key)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.group, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_to_string() {
        let key = SessionKey::new("10.0.0.1", "grpc.login");
        assert_eq!(key.to_string_key(), "grpc.login:10.0.0.1");
        assert_eq!(key.to_string(), "grpc.login:10.0.0.1");
    }

    #[test]
    fn test_same_key_different_groups() {
        let login = SessionKey::new("10.0.0.1", "login");
        let register = SessionKey::new("10.0.0.1", "register");

        assert_ne!(login, register);
        assert_ne!(login.to_string_key(), register.to_string_key());
    }
}
