//! Identifier generation and validation
//!
//! Provides:
//! - Room id generation for freshly paired endpoints
//! - Validation of client-supplied room ids
//! - Connection ids for log correlation

/// Number of random bytes in a generated room id
pub const ROOM_ID_BYTES: usize = 4;

/// Maximum length of a client-supplied room id in bytes
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Generate a random room id (e.g., "ab12cd34"), failing only if the OS RNG does
pub fn generate_room_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; ROOM_ID_BYTES];
    getrandom::fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Validate a client-supplied room id
pub fn validate_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && !room_id.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Generate an id used to tag log lines for a single connection
pub fn generate_connection_id() -> String {
    let mut bytes = [0u8; 8];
    match getrandom::fill(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(_) => {
            // Fall back to a process-local counter; the id only correlates logs
            use std::sync::atomic::{AtomicU64, Ordering};
            static NEXT: AtomicU64 = AtomicU64::new(1);
            format!("{:016x}", NEXT.fetch_add(1, Ordering::Relaxed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_room_id_format() {
        let id = generate_room_id().unwrap();
        assert_eq!(id.len(), ROOM_ID_BYTES * 2);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        assert!(validate_room_id(&id));
    }

    #[test]
    fn test_room_ids_differ() {
        let ids: HashSet<String> = (0..64).map(|_| generate_room_id().unwrap()).collect();
        // 32 bits of entropy; a collision among 64 draws is vanishingly unlikely
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("room1"));
        assert!(validate_room_id("ab12cd34"));
        assert!(!validate_room_id(""));
        assert!(!validate_room_id("room 1"));
        assert!(!validate_room_id("room\n"));
        assert!(!validate_room_id(&"x".repeat(MAX_ROOM_ID_LEN + 1)));
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = generate_connection_id();
        let id2 = generate_connection_id();

        assert_eq!(id1.len(), 16);
        assert_ne!(id1, id2);
    }
}
