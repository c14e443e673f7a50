//! The Image Ingestion Pipeline: mount, verify manifest, canonical-rename,
//! install artifacts, set blame, trigger activation.

use camino::{Utf8Path, Utf8PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::AgentPaths;
use crate::error::AgentError;
use crate::manifest::PushManifest;
use crate::mount;
use crate::permission::{self, Scope, Verdict};
use crate::signature::{verify_file, VerifyOutcome, Verifier};
use crate::store::{self, RevisionArtifacts};
use crate::target::Target;
use crate::task::TaskOutput;

/// The outcome of a successful ingestion.
#[derive(Debug)]
pub struct IngestOutcome {
    /// The logical image name the revision was installed under.
    pub image: String,
    /// The canonical (or, outside strict mode, manifest-supplied) revision
    /// stem that was installed.
    pub revision_stem: String,
    /// The activation script's captured output.
    pub activation: TaskOutput,
}

/// Ingest a signed image file authored by `key_ref`, landing at
/// `squashfs_path` in the drop directory.
pub fn ingest_image(
    paths: &AgentPaths,
    verifier: &dyn Verifier,
    squashfs_path: &Utf8Path,
    key_ref: &str,
) -> Result<IngestOutcome, AgentError> {
    // Step 1-2: verify the detached signature over the squashfs file.
    match verify_file(paths, verifier, squashfs_path, key_ref)? {
        VerifyOutcome::Ok => {}
        VerifyOutcome::BadSignature => {
            return Err(AgentError::InvalidSignatureAuth {
                message: format!("invalid signature for '{squashfs_path}'"),
            })
        }
        VerifyOutcome::MissingPubKey => {
            return Err(AgentError::InvalidSignatureAuth {
                message: format!("no public key on file for key-ref '{key_ref}'"),
            })
        }
    }

    // Step 3: mount the verified payload read-only.
    let mount_point = Utf8PathBuf::from(format!(
        "/tmp/run-deploy-mount-{}",
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    ));
    std::fs::create_dir(&mount_point).map_err(|e| AgentError::Mount {
        message: format!("could not create mount point: {e}"),
    })?;
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&mount_point, std::fs::Permissions::from_mode(0o700));
    }
    if let Err(e) = mount::mount_squashfs(squashfs_path, &mount_point) {
        let _ = std::fs::remove_file(squashfs_path);
        let _ = std::fs::remove_dir(&mount_point);
        return Err(AgentError::Mount {
            message: format!("failed to mount '{squashfs_path}': {e}"),
        });
    }

    // Step 4: require the manifest.
    let manifest_path = mount_point.join("_deploy").join("push.json");
    if !manifest_path.exists() {
        let _ = mount::unmount(&mount_point);
        let _ = std::fs::remove_file(squashfs_path);
        let _ = std::fs::remove_dir(&mount_point);
        return Err(AgentError::ManifestNotExist {
            message: "'_deploy/push.json' does not exist in the image".into(),
        });
    }

    // Step 5: copy `_deploy/` out to a working directory, unmount, move the
    // squashfs in alongside it.
    let base_stem = squashfs_path
        .file_stem()
        .ok_or_else(|| AgentError::Argument {
            message: "image file name has no stem".into(),
        })?
        .to_string();
    let working_dir = squashfs_path
        .parent()
        .unwrap_or_else(|| Utf8Path::new("."))
        .join(&base_stem);
    let result = copy_deploy_subtree(&mount_point, &working_dir);
    let _ = mount::unmount(&mount_point);
    let _ = std::fs::remove_dir(&mount_point);
    result.map_err(|e| AgentError::ManifestNotExist {
        message: format!("failed to stage '_deploy': {e}"),
    })?;

    let staged_squashfs = working_dir.join(squashfs_path.file_name().unwrap_or(squashfs_path.as_str()));
    std::fs::rename(squashfs_path, &staged_squashfs).map_err(|e| AgentError::ManifestNotExist {
        message: format!("failed to move squashfs into working dir: {e}"),
    })?;

    // From here on, any failure wipes the working directory.
    match ingest_from_working_dir(paths, &working_dir, &staged_squashfs, key_ref) {
        Ok(outcome) => {
            let _ = std::fs::remove_dir_all(&working_dir);
            Ok(outcome)
        }
        Err(e) => {
            let _ = std::fs::remove_dir_all(&working_dir);
            Err(e)
        }
    }
}

fn ingest_from_working_dir(
    paths: &AgentPaths,
    working_dir: &Utf8Path,
    staged_squashfs: &Utf8Path,
    key_ref: &str,
) -> Result<IngestOutcome, AgentError> {
    // Step 6: parse the manifest and select our host's section.
    let manifest_raw = std::fs::read_to_string(working_dir.join("push.json")).map_err(|e| AgentError::ManifestJson {
        message: format!("could not read push.json: {e}"),
    })?;
    let manifest = PushManifest::parse(&manifest_raw)?;
    let hostname = local_hostname();
    let section = manifest.section_for_host(&hostname)?;

    let container = section.incus_name.as_deref().filter(|_| {
        matches!(paths.edition(), crate::config::Edition::Container)
    });

    // Step 7: permission check.
    let verdict = permission::evaluate(
        paths,
        key_ref,
        Scope {
            container,
            image: &section.image_dir,
        },
    );
    permission::require(verdict, Verdict::allows_full, "full")?;

    let target = match container {
        Some(name) => Target::Container(name.to_string()),
        None => Target::Local,
    };

    // Step 8: container edition only — probe the container and ensure the
    // image directory exists inside it.
    if let Target::Container(_) = &target {
        if !target.probe_exists() {
            return Err(AgentError::ContainerNotExist {
                message: format!("container '{container:?}' does not exist or is unreachable"),
            });
        }
    }
    target.mkdir_p(&paths.image_dir(&section.image_dir)).map_err(|e| AgentError::ContainerNotExist {
        message: format!("could not create image directory on target: {e}"),
    })?;

    // Step 9: strict-mode canonical rename.
    let (revision_stem, activation_script_path) = if paths.strict_mode() {
        let stem = canonical_revision_stem(&section.image_dir, section.stamp);
        let canonical_squashfs = working_dir.join(format!("{stem}.squashfs"));
        std::fs::rename(staged_squashfs, &canonical_squashfs).map_err(|e| AgentError::ManifestJson {
            message: format!("failed to rename squashfs to canonical stem: {e}"),
        })?;
        let script_path = working_dir.join(&stem);
        let template = activation_script_template(paths, &section.image_dir, &stem);
        std::fs::write(&script_path, template).map_err(|e| AgentError::ManifestJson {
            message: format!("failed to write activation script: {e}"),
        })?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| AgentError::ManifestJson { message: e.to_string() })?;
        }
        (stem, script_path)
    } else {
        let script_path = working_dir.join(&section.exec);
        let stem = staged_squashfs
            .file_stem()
            .map(|s| s.to_string())
            .unwrap_or_default();
        // Re-point staged_squashfs at its own name since non-strict mode
        // keeps whatever the operator named it.
        let _ = &staged_squashfs;
        (stem, script_path)
    };

    // Step 10: the activation script must exist in the working directory.
    if !activation_script_path.exists() {
        return Err(AgentError::ExecNotExist {
            message: format!("activation script '{activation_script_path}' not found in image"),
        });
    }

    let squashfs_final_path = working_dir.join(format!("{revision_stem}.squashfs"));

    // Step 11-13: install and activate.
    let activation = store::install(
        paths,
        &target,
        &section.image_dir,
        &revision_stem,
        RevisionArtifacts {
            squashfs_path: &squashfs_final_path,
            activation_script_path: &activation_script_path,
            blame_text: key_ref,
        },
    )?;

    if !activation.success() {
        return Err(AgentError::ExecFail {
            message: format!("activation script exited {}: {}", activation.code, activation.stderr),
        });
    }

    Ok(IngestOutcome {
        image: section.image_dir,
        revision_stem,
        activation,
    })
}

fn copy_deploy_subtree(mount_point: &Utf8Path, working_dir: &Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir_all(working_dir)?;
    copy_dir_recursive(&mount_point.join("_deploy"), working_dir)
}

fn copy_dir_recursive(src: &Utf8Path, dest: &Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dest_path = dest.as_std_path().join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(
                &Utf8PathBuf::from_path_buf(src_path).unwrap(),
                &Utf8PathBuf::from_path_buf(dest_path).unwrap(),
            )?;
        } else {
            std::fs::copy(&src_path, &dest_path)?;
        }
    }
    Ok(())
}

fn local_hostname() -> String {
    rustix::system::uname()
        .nodename()
        .to_string_lossy()
        .to_string()
}

/// Compute the canonical `<image>-<UTC timestamp>` revision stem, using the
/// manifest's `stamp` if present (for reproducible builds) or the current
/// time otherwise.
fn canonical_revision_stem(image: &str, stamp: Option<i64>) -> String {
    let when = match stamp {
        Some(s) => chrono::DateTime::from_timestamp(s, 0).unwrap_or_else(chrono::Utc::now),
        None => chrono::Utc::now(),
    };
    format!("{image}-{}", when.format("%Y-%m-%d_%H-%M-%S"))
}

/// The strict-mode activation script template, using the rename-over-symlink
/// atomic swap pattern instead of a bare `ln -sf`, and treating the
/// per-image deploy hook as advisory when absent: a missing hook is a
/// successful activation, a present-but-failing hook is not.
fn activation_script_template(paths: &AgentPaths, image: &str, revision_stem: &str) -> String {
    let image_dir = paths.image_dir(image);
    let hook = paths.deploy_hook(image);
    format!(
        "#!/bin/sh\nset -e\ncd {image_dir}\nln -sfn {revision_stem}.squashfs {image}.squashfs.tmp\nmv -Tf {image}.squashfs.tmp {image}.squashfs\nif [ -x {hook} ]; then\n  exec {hook}\nfi\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_stem_uses_stamp_when_present() {
        // 2024-05-07T12:34:56Z
        let stamp = 1715085296;
        let stem = canonical_revision_stem("api", Some(stamp));
        assert_eq!(stem, "api-2024-05-07_12-34-56");
    }

    #[test]
    fn template_guards_missing_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let paths = AgentPaths::new(root, Utf8PathBuf::from("/tmp/unused"));
        let script = activation_script_template(&paths, "api", "api-2024-05-07_12-34-56");
        assert!(script.contains("if [ -x"));
        assert!(script.contains("mv -Tf"));
    }
}
