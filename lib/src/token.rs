//! One-shot CLI authorization tokens. A 64-char random token file is signed
//! on the workstation and uploaded to the drop directory; the worker
//! verifies it exactly like an image signature (same [`Verifier`](crate::signature::Verifier)
//! contract) and then deletes both files, which is what makes the token
//! single-use: any replay re-verifies against a file that no longer exists,
//! which the `minisign` contract reports as a bad signature, not a missing
//! file, so we map a vanished token to [`VerifyOutcome::BadSignature`]
//! rather than inventing a new error path.

use camino::Utf8PathBuf;

use crate::config::AgentPaths;
use crate::error::AgentError;
use crate::signature::{verify_file, VerifyOutcome, Verifier};

/// Verify the one-shot token named by `token_ref` against the public key
/// bound to `key_ref`. The token path convention is
/// `run-deploy-token-<nonce>`.
pub fn verify_token(
    paths: &AgentPaths,
    verifier: &dyn Verifier,
    token_ref: &str,
    key_ref: &str,
) -> Result<(), AgentError> {
    let token_path = paths
        .drop_dir()
        .join(format!("run-deploy-token-{token_ref}"));
    let token_path = Utf8PathBuf::from(token_path);

    if !token_path.exists() {
        // Already consumed, or never existed: treated identically to a bad
        // signature so a replay can't be distinguished from a forged token.
        return Err(AgentError::InvalidSignatureAuth {
            message: format!("token '{token_ref}' is not present or already used"),
        });
    }

    match verify_file(paths, verifier, &token_path, key_ref)? {
        VerifyOutcome::Ok => {
            let _ = std::fs::remove_file(&token_path);
            Ok(())
        }
        VerifyOutcome::BadSignature => Err(AgentError::InvalidSignatureAuth {
            message: "invalid signature on one-shot token".into(),
        }),
        VerifyOutcome::MissingPubKey => Err(AgentError::InvalidSignatureAuth {
            message: format!("no public key on file for key-ref '{key_ref}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Verifier as _;

    #[derive(Debug)]
    struct FakeVerifier(bool);
    impl Verifier for FakeVerifier {
        fn verify(
            &self,
            _file: &camino::Utf8Path,
            _sidecar: &camino::Utf8Path,
            _pubkey: &camino::Utf8Path,
        ) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    fn setup() -> (tempfile::TempDir, AgentPaths) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("root")).unwrap();
        let drop = Utf8PathBuf::from_path_buf(tmp.path().join("drop")).unwrap();
        std::fs::create_dir_all(root.join("minisign")).unwrap();
        std::fs::create_dir_all(&drop).unwrap();
        std::fs::write(root.join("minisign").join("alice@lap.pub"), b"key").unwrap();
        (tmp, AgentPaths::new(root, drop))
    }

    #[test]
    fn token_is_single_use() {
        let (_tmp, paths) = setup();
        let token_path = paths.drop_dir().join("run-deploy-token-abc123");
        std::fs::write(&token_path, b"t").unwrap();
        std::fs::write(format!("{token_path}.minisig"), b"sig").unwrap();

        verify_token(&paths, &FakeVerifier(true), "abc123", "alice@lap").unwrap();
        assert!(!token_path.exists());

        let replay = verify_token(&paths, &FakeVerifier(true), "abc123", "alice@lap");
        assert!(matches!(replay, Err(AgentError::InvalidSignatureAuth { .. })));
    }
}
