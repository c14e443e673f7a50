//! Identifier grammars. Every value arriving from the wire, the environment,
//! or a parsed manifest is validated here before it reaches a filesystem path
//! or a subprocess argv — this is the one place traversal and argument
//! injection are supposed to be impossible.

use crate::error::AgentError;

/// A file-path segment: image file names, activation-script names, revision
/// stems. Allows `.` (needed for `<stem>.squashfs`/`<stem>.blame`) but still
/// bars `/` and control characters, so callers must additionally reject `..`
/// themselves if a bare `.` would be ambiguous (it is not, here: revision
/// stems are always `<flag-identifier>-<timestamp>`, which cannot equal `..`).
pub fn validate_file_path_segment(value: &str) -> Result<(), AgentError> {
    validate(value, "file name", |c| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
    })
    .and_then(|()| {
        if value == ".." || value == "." {
            Err(AgentError::file_name(format!(
                "'{value}' is not a valid file name"
            )))
        } else {
            Ok(())
        }
    })
}

/// A flag identifier: container names, image-directory names, operator-
/// supplied revision stems, exec command names. No `.` at all, so `..`
/// cannot appear even as a substring trick.
pub fn validate_flag_identifier(value: &str) -> Result<(), AgentError> {
    validate(value, "identifier", |c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
    })
}

/// A key-ref: conventionally `user@host`, used as both the authorization
/// identity and the blame value.
pub fn validate_key_ref(value: &str) -> Result<(), AgentError> {
    if value.is_empty() {
        return Err(AgentError::key_ref("key-ref must not be empty"));
    }
    for c in value.chars() {
        if !(c.is_ascii_alphanumeric() || matches!(c, '@' | '_' | '-' | '.')) {
            return Err(AgentError::key_ref(format!(
                "key-ref '{value}' contains disallowed character '{c}'"
            )));
        }
    }
    Ok(())
}

fn validate(
    value: &str,
    what: &str,
    allowed: impl Fn(char) -> bool,
) -> Result<(), AgentError> {
    if value.is_empty() {
        return Err(AgentError::file_name(format!("{what} must not be empty")));
    }
    for c in value.chars() {
        if !allowed(c) {
            return Err(AgentError::file_name(format!(
                "{what} '{value}' contains disallowed character '{c}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_path_segment_accepts_revision_stems() {
        assert!(validate_file_path_segment("api-2024-05-07_12-34-56").is_ok());
        assert!(validate_file_path_segment("api-2024-05-07_12-34-56.squashfs").is_ok());
        assert!(validate_file_path_segment("api-2024-05-07_12-34-56.blame").is_ok());
    }

    #[test]
    fn file_path_segment_rejects_traversal() {
        assert!(validate_file_path_segment("..").is_err());
        assert!(validate_file_path_segment("../etc").is_err());
        assert!(validate_file_path_segment("a/b").is_err());
        assert!(validate_file_path_segment("a\nb").is_err());
    }

    #[test]
    fn flag_identifier_rejects_dot() {
        assert!(validate_flag_identifier("api").is_ok());
        assert!(validate_flag_identifier("api.v2").is_err());
        assert!(validate_flag_identifier("..").is_err());
    }

    #[test]
    fn key_ref_allows_conventional_form() {
        assert!(validate_key_ref("alice@lap").is_ok());
        assert!(validate_key_ref("alice@lap.example.com").is_ok());
        assert!(validate_key_ref("a/b").is_err());
        assert!(validate_key_ref("").is_err());
    }
}
