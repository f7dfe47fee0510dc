//! Redis key builders
//!
//! Centralising key construction prevents typos and makes it easy to find
//! every key the relay touches.

use chatrelay_shared::UserId;

const PREFIX: &str = "chatrelay";

/// Live-connection refcount for a user.
pub fn presence(user_id: UserId) -> String {
    format!("{PREFIX}:presence:{user_id}")
}

/// Offline message queue (list) for a user.
pub fn queue(user_id: UserId) -> String {
    format!("{PREFIX}:queue:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced_per_user() {
        assert_eq!(presence(UserId(7)), "chatrelay:presence:7");
        assert_eq!(queue(UserId(7)), "chatrelay:queue:7");
        assert_ne!(queue(UserId(7)), queue(UserId(8)));
    }
}
