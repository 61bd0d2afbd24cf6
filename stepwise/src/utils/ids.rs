//! Identifier generation.

use uuid::Uuid;

/// Generates a time-ordered id for queue items.
#[must_use]
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates the token stamped on an item by each claim.
#[must_use]
pub fn generate_lease_token() -> Uuid {
    Uuid::new_v4()
}

/// Generates a broker message id in `<millis>-<seq>` form.
#[must_use]
pub fn generate_message_id(millis: i64, seq: u64) -> String {
    format!("{millis}-{seq}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_uuid() {
        let id = generate_id();
        let parsed = Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }

    #[test]
    fn test_lease_tokens_are_unique() {
        assert_ne!(generate_lease_token(), generate_lease_token());
    }

    #[test]
    fn test_message_id_format() {
        assert_eq!(generate_message_id(1700000000000, 3), "1700000000000-3");
    }
}
