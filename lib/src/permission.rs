//! The Permission Engine: a pure function from `(key_ref, container, image,
//! operation)` to a verdict, evaluated against an on-disk TOML policy tree.
//! Given the same inputs and the same files, it always returns the same
//! answer — it never writes to the policy files it reads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AgentPaths;
use crate::error::AgentError;

/// The three-level (plus denial/ban) decision the engine can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Unrestricted; implies `Full` and `Read`.
    Admin,
    /// Read and write for the scope in question.
    Full,
    /// Read-only for the scope in question.
    Read,
    /// No access.
    Denied,
    /// Explicitly banned; fails closed regardless of other grants.
    Banned,
}

impl Verdict {
    /// `must_be_admin()`: only [`Verdict::Admin`] passes.
    pub fn allows_admin(self) -> bool {
        matches!(self, Verdict::Admin)
    }

    /// `must_be_full()`: [`Verdict::Admin`] or [`Verdict::Full`] passes.
    pub fn allows_full(self) -> bool {
        matches!(self, Verdict::Admin | Verdict::Full)
    }

    /// `must_be_read()`: [`Verdict::Admin`], [`Verdict::Full`], or
    /// [`Verdict::Read`] passes.
    pub fn allows_read(self) -> bool {
        matches!(self, Verdict::Admin | Verdict::Full | Verdict::Read)
    }
}

/// JSON snapshot returned by the `permission-json` verb, standardized
/// across editions.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSnapshot {
    /// Caller is admin.
    pub admin: bool,
    /// Caller has full (read+write) access to this scope.
    pub full: bool,
    /// Caller has read access to this scope.
    pub read: bool,
}

impl From<Verdict> for PermissionSnapshot {
    fn from(v: Verdict) -> Self {
        Self {
            admin: v.allows_admin(),
            full: v.allows_full(),
            read: v.allows_read(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ContainerScope {
    #[serde(rename = "full-access", default)]
    full_access: bool,
    #[serde(rename = "read-access", default)]
    read_access: bool,
    #[serde(default)]
    permit: Vec<String>,
    #[serde(rename = "permit-read", default)]
    permit_read: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyDoc {
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    banned: bool,
    #[serde(rename = "full-access", default)]
    full_access: bool,
    #[serde(rename = "read-access", default)]
    read_access: bool,
    #[serde(rename = "incus-full-access", default)]
    incus_full_access: bool,
    #[serde(rename = "incus-read-access", default)]
    incus_read_access: bool,
    #[serde(default)]
    incus: BTreeMap<String, ContainerScope>,
    /// Bare-metal has no container axis, so `[metal]` is one flat scope
    /// rather than a per-name table.
    #[serde(default)]
    metal: ContainerScope,
}

/// The scope a request is being evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    /// The selected container name (container edition only); `None` in the
    /// bare-metal edition.
    pub container: Option<&'a str>,
    /// The logical image name.
    pub image: &'a str,
}

/// Evaluate the permission document for `key_ref` against `scope`,
/// following this short-circuiting order:
///
/// 1. no `permission/` directory at all ⇒ bootstrap admin
/// 2. no file for this key-ref ⇒ denied
/// 3. parse failure ⇒ denied
/// 4. `admin=true` ⇒ admin
/// 5. `banned=true` ⇒ banned
/// 6. `full-access=true` ⇒ full everywhere
/// 7. `read-access=true` ⇒ read everywhere
/// 8. per-container blanket grant (container edition only)
/// 9. per-(container,image) leaf grant
pub fn evaluate(paths: &AgentPaths, key_ref: &str, scope: Scope<'_>) -> Verdict {
    let permission_dir = paths.permission_dir();
    if !permission_dir.exists() {
        tracing::warn!(
            "no permission/ directory present; granting bootstrap dev-mode admin to '{key_ref}' — \
             provision a permission file before going to production"
        );
        return Verdict::Admin;
    }

    let policy_path = permission_dir.join(format!("{key_ref}.toml"));
    let Ok(raw) = std::fs::read_to_string(&policy_path) else {
        return Verdict::Denied;
    };
    let Ok(doc) = toml::from_str::<PolicyDoc>(&raw) else {
        return Verdict::Denied;
    };

    if doc.admin {
        return Verdict::Admin;
    }
    if doc.banned {
        return Verdict::Banned;
    }
    if doc.full_access {
        return Verdict::Full;
    }
    if doc.read_access {
        return Verdict::Read;
    }

    let leaf = match scope.container {
        Some(container) => {
            if doc.incus_full_access {
                return Verdict::Full;
            }
            if doc.incus_read_access {
                return Verdict::Read;
            }
            doc.incus.get(container)
        }
        None => Some(&doc.metal),
    };

    if let Some(leaf) = leaf {
        if leaf.full_access {
            return Verdict::Full;
        }
        if leaf.read_access {
            return Verdict::Read;
        }
        if leaf.permit.iter().any(|i| i == scope.image) {
            return Verdict::Full;
        }
        if leaf.permit_read.iter().any(|i| i == scope.image) {
            return Verdict::Read;
        }
    }

    Verdict::Denied
}

/// Translate a verdict into the `PERMISSION` wire error, for callers that
/// need `Result` rather than a raw [`Verdict`].
pub fn require(verdict: Verdict, allowed: impl Fn(Verdict) -> bool, what: &str) -> Result<(), AgentError> {
    if verdict == Verdict::Banned {
        return Err(AgentError::Permission {
            message: "caller is banned".into(),
        });
    }
    if allowed(verdict) {
        Ok(())
    } else {
        Err(AgentError::Permission {
            message: format!("caller does not have {what} permission"),
        })
    }
}

/// Snapshot used by the `permission-json` verb.
pub fn describe(paths: &AgentPaths, key_ref: &str, scope: Scope<'_>) -> PermissionSnapshot {
    evaluate(paths, key_ref, scope).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn setup() -> (tempfile::TempDir, AgentPaths) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        (tmp, AgentPaths::new(root, Utf8PathBuf::from("/tmp/unused")))
    }

    #[test]
    fn absent_permission_tree_is_bootstrap_admin() {
        let (_tmp, paths) = setup();
        let v = evaluate(&paths, "anyone@anywhere", Scope { container: Some("web"), image: "api" });
        assert!(v.allows_admin());
    }

    #[test]
    fn absent_file_for_key_ref_is_denied() {
        let (_tmp, paths) = setup();
        std::fs::create_dir_all(paths.permission_dir()).unwrap();
        let v = evaluate(&paths, "bob@lap", Scope { container: Some("web"), image: "api" });
        assert_eq!(v, Verdict::Denied);
    }

    #[test]
    fn read_access_only_blocks_full() {
        let (_tmp, paths) = setup();
        std::fs::create_dir_all(paths.permission_dir()).unwrap();
        std::fs::write(
            paths.permission_dir().join("bob@lap.toml"),
            "read-access = true\n",
        )
        .unwrap();
        let v = evaluate(&paths, "bob@lap", Scope { container: Some("web"), image: "api" });
        assert!(v.allows_read());
        assert!(!v.allows_full());
    }

    #[test]
    fn banned_overrides_grants() {
        let (_tmp, paths) = setup();
        std::fs::create_dir_all(paths.permission_dir()).unwrap();
        std::fs::write(
            paths.permission_dir().join("bob@lap.toml"),
            "banned = true\nfull-access = true\n",
        )
        .unwrap();
        let v = evaluate(&paths, "bob@lap", Scope { container: Some("web"), image: "api" });
        assert_eq!(v, Verdict::Banned);
    }

    #[test]
    fn per_image_permit_grants_full_for_named_image_only() {
        let (_tmp, paths) = setup();
        std::fs::create_dir_all(paths.permission_dir()).unwrap();
        std::fs::write(
            paths.permission_dir().join("carol@lap.toml"),
            "[incus.web]\npermit = [\"api\"]\n",
        )
        .unwrap();
        let v = evaluate(&paths, "carol@lap", Scope { container: Some("web"), image: "api" });
        assert!(v.allows_full());
        let v2 = evaluate(&paths, "carol@lap", Scope { container: Some("web"), image: "other" });
        assert_eq!(v2, Verdict::Denied);
    }
}
