//! The Signature Gate: a thin wrapper around the external `minisign` binary
//! that is treated as a black box with the contract "signs with a named
//! private key; verifies against a named public key and yields success or
//! failure". This module owns nothing but the sidecar-file bookkeeping and
//! path construction around that contract.

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::AgentPaths;
use crate::names::validate_key_ref;
use crate::task::Task;

/// Outcome of verifying a detached signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Signature verified.
    Ok,
    /// The signer rejected the signature.
    BadSignature,
    /// The public key file for this key-ref does not exist. This is a
    /// fatal authentication failure, not a silent denial.
    MissingPubKey,
}

/// Anything that can check a detached signature. Production code shells
/// out to the real `minisign` binary; tests substitute a fake so the suite
/// doesn't depend on the binary or real key material being present.
pub trait Verifier: std::fmt::Debug {
    /// Verify `file`'s detached signature at `sidecar` against `pubkey`.
    fn verify(&self, file: &Utf8Path, sidecar: &Utf8Path, pubkey: &Utf8Path) -> anyhow::Result<bool>;
}

/// Shells out to `minisign -Vqm <file> -p <pubkey>`.
#[derive(Debug, Default)]
pub struct MinisignVerifier;

impl Verifier for MinisignVerifier {
    fn verify(&self, file: &Utf8Path, _sidecar: &Utf8Path, pubkey: &Utf8Path) -> anyhow::Result<bool> {
        let out = Task::new("minisign verify", "minisign")
            .args(["-Vqm", file.as_str(), "-p", pubkey.as_str()])
            .run_captured()?;
        Ok(out.success())
    }
}

/// Resolve the public key path for a key-ref, after validating its grammar.
/// Pure path construction; does not touch the filesystem.
pub fn bind_key_ref(paths: &AgentPaths, key_ref: &str) -> Result<Utf8PathBuf, crate::error::AgentError> {
    validate_key_ref(key_ref)?;
    Ok(paths.minisign_dir().join(format!("{key_ref}.pub")))
}

/// Verify `path`'s detached signature (read from the sibling `<path>.minisig`)
/// under the public key bound to `key_ref`.
///
/// On [`VerifyOutcome::Ok`], the `.minisig` sidecar is deleted. On
/// [`VerifyOutcome::BadSignature`], both `path` and its sidecar are deleted,
/// refusing to leave attacker-controlled content in the drop directory.
/// [`VerifyOutcome::MissingPubKey`] leaves both files untouched — this is a
/// caller configuration problem, not an attack, and the caller may want the
/// file for diagnosis.
pub fn verify_file(
    paths: &AgentPaths,
    verifier: &dyn Verifier,
    path: &Utf8Path,
    key_ref: &str,
) -> Result<VerifyOutcome, crate::error::AgentError> {
    let pubkey = bind_key_ref(paths, key_ref)?;
    let sidecar = Utf8PathBuf::from(format!("{path}.minisig"));

    if !pubkey.exists() {
        return Ok(VerifyOutcome::MissingPubKey);
    }

    let ok = verifier
        .verify(path, &sidecar, &pubkey)
        .unwrap_or(false);

    if ok {
        let _ = std::fs::remove_file(&sidecar);
        Ok(VerifyOutcome::Ok)
    } else {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(&sidecar);
        Ok(VerifyOutcome::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeVerifier(bool);
    impl Verifier for FakeVerifier {
        fn verify(&self, _file: &Utf8Path, _sidecar: &Utf8Path, _pubkey: &Utf8Path) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    fn setup() -> (tempfile::TempDir, AgentPaths) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("minisign")).unwrap();
        let paths = AgentPaths::new(root, Utf8PathBuf::from("/tmp/unused"));
        (tmp, paths)
    }

    #[test]
    fn missing_pub_key_leaves_files_alone() {
        let (tmp, paths) = setup();
        let file = Utf8PathBuf::from_path_buf(tmp.path().join("img.squashfs")).unwrap();
        std::fs::write(&file, b"data").unwrap();
        std::fs::write(format!("{file}.minisig"), b"sig").unwrap();
        let outcome = verify_file(&paths, &FakeVerifier(true), &file, "nobody@nowhere").unwrap();
        assert_eq!(outcome, VerifyOutcome::MissingPubKey);
        assert!(file.exists());
    }

    #[test]
    fn good_signature_deletes_only_sidecar() {
        let (tmp, paths) = setup();
        std::fs::write(paths.minisign_dir().join("alice@lap.pub"), b"key").unwrap();
        let file = Utf8PathBuf::from_path_buf(tmp.path().join("img.squashfs")).unwrap();
        std::fs::write(&file, b"data").unwrap();
        let sidecar = format!("{file}.minisig");
        std::fs::write(&sidecar, b"sig").unwrap();
        let outcome = verify_file(&paths, &FakeVerifier(true), &file, "alice@lap").unwrap();
        assert_eq!(outcome, VerifyOutcome::Ok);
        assert!(file.exists());
        assert!(!Utf8Path::new(&sidecar).exists());
    }

    #[test]
    fn bad_signature_deletes_both() {
        let (tmp, paths) = setup();
        std::fs::write(paths.minisign_dir().join("alice@lap.pub"), b"key").unwrap();
        let file = Utf8PathBuf::from_path_buf(tmp.path().join("img.squashfs")).unwrap();
        std::fs::write(&file, b"data").unwrap();
        let sidecar = format!("{file}.minisig");
        std::fs::write(&sidecar, b"sig").unwrap();
        let outcome = verify_file(&paths, &FakeVerifier(false), &file, "alice@lap").unwrap();
        assert_eq!(outcome, VerifyOutcome::BadSignature);
        assert!(!file.exists());
        assert!(!Utf8Path::new(&sidecar).exists());
    }

    #[test]
    fn rejects_bad_key_ref_grammar() {
        let (_tmp, paths) = setup();
        let err = bind_key_ref(&paths, "a/b").unwrap_err();
        assert!(matches!(err, crate::error::AgentError::KeyRefValidation { .. }));
    }
}
