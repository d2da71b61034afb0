//! Validation for values that end up inside an outbound frame.
//!
//! The wire format is a comma-separated text line, so a stray `,` or line
//! terminator in a device id or verb would silently change the meaning of the
//! frame (or split it in two). Everything a producer hands to the gateway goes
//! through these checks before it is queued.

/// Longest device id accepted from producers.
pub const MAX_ID_LEN: usize = 64;
/// Longest verb accepted from producers.
pub const MAX_VERB_LEN: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("device id is empty")]
    EmptyId,

    #[error("device id is too long (maximum {max} characters)")]
    IdTooLong { max: usize },

    #[error("device id contains invalid characters: {chars}")]
    InvalidIdCharacters { chars: String },

    #[error("command verb is empty")]
    EmptyVerb,

    #[error("command verb is too long (maximum {max} characters)")]
    VerbTooLong { max: usize },

    #[error("command verb contains a line terminator or the checksum delimiter")]
    VerbBreaksFrame,

    #[error("secret key must be non-empty printable ASCII without ','")]
    InvalidKey,
}

fn is_field_char(c: char) -> bool {
    c.is_ascii_graphic() && c != ','
}

/// Device ids: printable ASCII, no commas, no spaces.
pub fn validate_device_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId);
    }
    if id.len() > MAX_ID_LEN {
        return Err(ValidationError::IdTooLong { max: MAX_ID_LEN });
    }
    let bad: String = id.chars().filter(|c| !is_field_char(*c)).collect();
    if !bad.is_empty() {
        return Err(ValidationError::InvalidIdCharacters {
            chars: bad.escape_default().to_string(),
        });
    }
    Ok(())
}

/// Verbs are the last field of the frame, so `,` and `:` are fine; only line
/// terminators and an embedded checksum delimiter are rejected.
pub fn validate_verb(verb: &str) -> Result<(), ValidationError> {
    if verb.is_empty() {
        return Err(ValidationError::EmptyVerb);
    }
    if verb.len() > MAX_VERB_LEN {
        return Err(ValidationError::VerbTooLong { max: MAX_VERB_LEN });
    }
    if verb.contains(['\n', '\r']) || verb.contains(crate::gateway::checksum::CRC_DELIMITER) {
        return Err(ValidationError::VerbBreaksFrame);
    }
    Ok(())
}

pub fn validate_secret_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() || !key.chars().all(is_field_char) {
        return Err(ValidationError::InvalidKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        for id in ["D1", "TBE0123456789ZB", "node-07", "a:b"] {
            assert!(validate_device_id(id).is_ok(), "{}", id);
        }
    }

    #[test]
    fn rejects_ids_that_break_framing() {
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyId));
        assert!(matches!(
            validate_device_id("D1,CMD:x"),
            Err(ValidationError::InvalidIdCharacters { .. })
        ));
        assert!(matches!(
            validate_device_id("D1\n"),
            Err(ValidationError::InvalidIdCharacters { .. })
        ));
        assert!(matches!(
            validate_device_id(&"x".repeat(MAX_ID_LEN + 1)),
            Err(ValidationError::IdTooLong { .. })
        ));
    }

    #[test]
    fn verbs_may_carry_arguments() {
        assert!(validate_verb("led_status:1").is_ok());
        assert!(validate_verb("set:a,b").is_ok());
        assert_eq!(validate_verb(""), Err(ValidationError::EmptyVerb));
        assert_eq!(validate_verb("CHECK\n"), Err(ValidationError::VerbBreaksFrame));
        assert_eq!(validate_verb("x,CRC:00000000"), Err(ValidationError::VerbBreaksFrame));
    }

    #[test]
    fn keys_are_single_field_tokens() {
        assert!(validate_secret_key("123").is_ok());
        assert_eq!(validate_secret_key(""), Err(ValidationError::InvalidKey));
        assert_eq!(validate_secret_key("a,b"), Err(ValidationError::InvalidKey));
        assert_eq!(validate_secret_key("a b"), Err(ValidationError::InvalidKey));
    }
}
