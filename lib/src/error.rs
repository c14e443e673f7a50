//! The wire-level error contract described in the agent's external interface:
//! every failed verb or deploy surfaces one of these kinds as
//! `{"error_name": ..., "message": ...}` on stderr with exit code 100.

use serde::Serialize;

/// A single closed enum of everything that can go wrong in a way the
/// frontend or the operator needs to distinguish.
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "error_name", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentError {
    /// Wrong number or shape of CLI arguments.
    #[error("{message}")]
    Argument {
        /// Human-readable detail.
        message: String,
    },
    /// A file-path-segment or flag-identifier grammar violation.
    #[error("{message}")]
    FileNameValidation {
        /// Human-readable detail.
        message: String,
    },
    /// A key-ref grammar violation.
    #[error("{message}")]
    KeyRefValidation {
        /// Human-readable detail.
        message: String,
    },
    /// Missing `RUN_DEPLOY_TOKEN`/`RUN_DEPLOY_KEY` environment for a CLI verb.
    #[error("{message}")]
    TokenKey {
        /// Human-readable detail.
        message: String,
    },
    /// The signer rejected a signature (image or one-shot token).
    #[error("{message}")]
    InvalidSignatureAuth {
        /// Human-readable detail.
        message: String,
    },
    /// Could not mount the squashfs image.
    #[error("{message}")]
    Mount {
        /// Human-readable detail.
        message: String,
    },
    /// `_deploy/push.json` is absent from the mounted image.
    #[error("{message}")]
    ManifestNotExist {
        /// Human-readable detail.
        message: String,
    },
    /// `push.json` is malformed, or missing the section for this host.
    #[error("{message}")]
    ManifestJson {
        /// Human-readable detail.
        message: String,
    },
    /// The permission engine denied the request, or the caller is banned.
    #[error("{message}")]
    Permission {
        /// Human-readable detail.
        message: String,
    },
    /// The container-exec probe failed (container edition only).
    #[error("{message}")]
    ContainerNotExist {
        /// Human-readable detail.
        message: String,
    },
    /// The activation script is missing from the installed image.
    #[error("{message}")]
    ExecNotExist {
        /// Human-readable detail.
        message: String,
    },
    /// The activation script ran but exited non-zero.
    #[error("{message}")]
    ExecFail {
        /// Carries the script's stderr and exit code.
        message: String,
    },
    /// The verb dispatch table has no entry for the requested command.
    #[error("{message}")]
    CommandNotFound {
        /// Human-readable detail.
        message: String,
    },
}

impl AgentError {
    /// Exit code used for every structured error, per the external interface.
    pub const EXIT_CODE: i32 = 100;

    /// Construct the `FileNameValidation` variant.
    pub fn file_name(message: impl Into<String>) -> Self {
        Self::FileNameValidation {
            message: message.into(),
        }
    }

    /// Construct the `KeyRefValidation` variant.
    pub fn key_ref(message: impl Into<String>) -> Self {
        Self::KeyRefValidation {
            message: message.into(),
        }
    }

    /// Render this error as the documented `{"error_name": ..., "message": ...}`
    /// JSON object, without touching stderr. Used by callers (the queue
    /// dispatcher) that need the rendered text to ship over a reply channel
    /// rather than print it directly.
    pub fn to_wire_json(&self) -> String {
        // A JSON object with exactly the fields our callers expect; this
        // should never fail to serialize since every field is a String.
        serde_json::to_string(self).expect("serializing AgentError")
    }

    /// Write this error to stderr as the documented JSON object and return
    /// the exit code the caller should use.
    pub fn emit(&self) -> i32 {
        eprintln!("{}", self.to_wire_json());
        Self::EXIT_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_expected_shape() {
        let e = AgentError::Permission {
            message: "denied".into(),
        };
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&e).unwrap()).unwrap();
        assert_eq!(v["error_name"], "PERMISSION");
        assert_eq!(v["message"], "denied");
    }
}
