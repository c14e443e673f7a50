//! The Manifest Decoder: parses the per-image push manifest embedded at
//! `_deploy/push.json` and selects the section for this host.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::AgentError;
use crate::names::{validate_file_path_segment, validate_flag_identifier};

/// One host's section of `push.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct HostSection {
    /// Container edition only: the container that receives the artifacts.
    #[serde(rename = "incus-name")]
    pub incus_name: Option<String>,
    /// The logical image name.
    #[serde(rename = "image-dir")]
    pub image_dir: String,
    /// The activation script's base name inside `_deploy/`.
    pub exec: String,
    /// Optional POSIX timestamp for deterministic, reproducible revision
    /// names.
    pub stamp: Option<i64>,
}

/// The full manifest: a mapping from hostname to [`HostSection`].
#[derive(Debug, Clone, Deserialize)]
pub struct PushManifest(BTreeMap<String, HostSection>);

impl PushManifest {
    /// Parse `raw` as the push manifest JSON.
    pub fn parse(raw: &str) -> Result<Self, AgentError> {
        serde_json::from_str(raw).map_err(|e| AgentError::ManifestJson {
            message: format!("malformed push.json: {e}"),
        })
    }

    /// Select and validate the section for `hostname`: any missing or
    /// malformed field is a `MANIFEST_JSON` error.
    pub fn section_for_host(&self, hostname: &str) -> Result<HostSection, AgentError> {
        let section = self.0.get(hostname).cloned().ok_or_else(|| AgentError::ManifestJson {
            message: format!("push.json has no section for host '{hostname}'"),
        })?;

        validate_flag_identifier(&section.image_dir).map_err(|_| AgentError::ManifestJson {
            message: format!("invalid image-dir '{}'", section.image_dir),
        })?;
        validate_file_path_segment(&section.exec).map_err(|_| AgentError::ManifestJson {
            message: format!("invalid exec name '{}'", section.exec),
        })?;
        if let Some(incus_name) = &section.incus_name {
            validate_flag_identifier(incus_name).map_err(|_| AgentError::ManifestJson {
                message: format!("invalid incus-name '{incus_name}'"),
            })?;
        }

        Ok(section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
        "myhost": {"incus-name": "web", "image-dir": "api", "exec": "init"},
        "other-host": {"image-dir": "api", "exec": "init"}
    }"#;

    #[test]
    fn selects_matching_host() {
        let m = PushManifest::parse(EXAMPLE).unwrap();
        let s = m.section_for_host("myhost").unwrap();
        assert_eq!(s.image_dir, "api");
        assert_eq!(s.incus_name.as_deref(), Some("web"));
    }

    #[test]
    fn missing_host_section_is_manifest_json_error() {
        let m = PushManifest::parse(EXAMPLE).unwrap();
        let err = m.section_for_host("no-such-host").unwrap_err();
        assert!(matches!(err, AgentError::ManifestJson { .. }));
    }

    #[test]
    fn malformed_json_is_manifest_json_error() {
        let err = PushManifest::parse("{not json").unwrap_err();
        assert!(matches!(err, AgentError::ManifestJson { .. }));
    }

    #[test]
    fn rejects_traversal_in_image_dir() {
        let raw = r#"{"h": {"image-dir": "../etc", "exec": "init"}}"#;
        let m = PushManifest::parse(raw).unwrap();
        let err = m.section_for_host("h").unwrap_err();
        assert!(matches!(err, AgentError::ManifestJson { .. }));
    }
}
