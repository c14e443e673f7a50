//! The Retention Cleaner ("spring-clean"): for each image directory, keep
//! the newest N revisions and delete the rest.

use crate::config::AgentPaths;
use crate::store::{self, RevisionEntry};
use crate::target::Target;

/// Default retention count, matching the `--keep` default used elsewhere.
pub const DEFAULT_KEEP: usize = 20;

/// One revision marked for deletion by the cleaner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    /// The image it belongs to.
    pub image: String,
    /// Its revision stem.
    pub stem: String,
}

/// The outcome of running the cleaner.
#[derive(Debug)]
pub enum RetentionOutcome {
    /// Dry-run: no filesystem mutation happened. `script` is the POSIX
    /// shell the cleaner would have executed instead of running it.
    DryRun {
        /// The would-be `rm` script, or `None` if nothing would be deleted.
        script: Option<String>,
    },
    /// Applied: the listed victims were actually deleted.
    Applied {
        /// Every (image, stem) pair whose triple was removed.
        deleted: Vec<Victim>,
    },
}

/// Run retention across every image directory under `target`, keeping the
/// newest `keep` revisions per image. A per-image enumeration failure is
/// logged and skipped rather than aborting the whole run.
pub fn clean(paths: &AgentPaths, target: &Target, keep: usize, dry_run: bool) -> anyhow::Result<RetentionOutcome> {
    let images = store::list_images(paths, target)?;

    let mut victims = Vec::new();
    for image in &images {
        match store::list(paths, target, image) {
            Ok(revisions) => victims.extend(victims_for_image(image, &revisions, keep)),
            Err(e) => {
                tracing::warn!(image = %image, error = %e, "spring-clean: failed to enumerate revisions, skipping");
            }
        }
    }

    if dry_run {
        return Ok(RetentionOutcome::DryRun { script: dry_run_script(paths, &victims) });
    }

    let mut deleted = Vec::new();
    for victim in victims {
        let dir = paths.image_dir(&victim.image);
        target.remove_file(&dir.join(format!("{}.blame", victim.stem)))?;
        target.remove_file(&dir.join(format!("{}.squashfs", victim.stem)))?;
        target.remove_file(&dir.join(&victim.stem))?;
        deleted.push(victim);
    }
    Ok(RetentionOutcome::Applied { deleted })
}

/// Newest-first revisions beyond the `keep`'th are victims. The current
/// revision is always the most recently activated and therefore always
/// among the newest, so it can never land here by construction; we still
/// skip it defensively rather than ever dangle the current-pointer symlink.
fn victims_for_image(image: &str, revisions: &[RevisionEntry], keep: usize) -> Vec<Victim> {
    revisions
        .iter()
        .skip(keep)
        .filter(|r| !r.is_current)
        .map(|r| Victim {
            image: image.to_string(),
            stem: r.stem.clone(),
        })
        .collect()
}

fn dry_run_script(paths: &AgentPaths, victims: &[Victim]) -> Option<String> {
    if victims.is_empty() {
        return None;
    }
    let mut lines = vec!["#!/bin/sh".to_string()];
    for victim in victims {
        let dir = paths.image_dir(&victim.image);
        lines.push(format!("rm '{}'", dir.join(format!("{}.blame", victim.stem))));
        lines.push(format!("rm '{}'", dir.join(&victim.stem)));
        lines.push(format!("rm '{}'", dir.join(format!("{}.squashfs", victim.stem))));
    }
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn write_revision(dir: &camino::Utf8Path, stem: &str) {
        std::fs::write(dir.join(format!("{stem}.blame")), "alice@lap").unwrap();
        std::fs::write(dir.join(format!("{stem}.squashfs")), "x").unwrap();
        std::fs::write(dir.join(stem), "#!/bin/sh\nexit 0\n").unwrap();
    }

    fn setup(n: usize) -> (tempfile::TempDir, AgentPaths) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let paths = AgentPaths::new(root.clone(), Utf8PathBuf::from("/tmp/unused"));
        let dir = paths.image_dir("api");
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..n {
            write_revision(&dir, &format!("api-2024-01-{:02}_00-00-00", i + 1));
        }
        let newest = format!("api-2024-01-{:02}_00-00-00", n);
        Target::Local.atomic_symlink(&dir, "api.squashfs", &format!("{newest}.squashfs")).unwrap();
        (tmp, paths)
    }

    #[test]
    fn keeps_newest_n_and_deletes_the_rest() {
        let (_tmp, paths) = setup(25);
        let outcome = clean(&paths, &Target::Local, 20, false).unwrap();
        let RetentionOutcome::Applied { deleted } = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(deleted.len(), 5);
        let dir = paths.image_dir("api");
        let remaining = store::list(&paths, &Target::Local, "api").unwrap();
        assert_eq!(remaining.len(), 20);
        assert!(store::current(&paths, &Target::Local, "api").unwrap().is_some());
        let _ = dir;
    }

    #[test]
    fn dry_run_touches_nothing() {
        let (_tmp, paths) = setup(25);
        let outcome = clean(&paths, &Target::Local, 20, true).unwrap();
        let RetentionOutcome::DryRun { script } = outcome else {
            panic!("expected DryRun");
        };
        let script = script.unwrap();
        assert!(script.contains("#!/bin/sh"));
        assert!(script.contains("rm '"));
        let remaining = store::list(&paths, &Target::Local, "api").unwrap();
        assert_eq!(remaining.len(), 25);
    }

    #[test]
    fn never_deletes_current_even_if_beyond_keep() {
        let (_tmp, paths) = setup(5);
        let outcome = clean(&paths, &Target::Local, 0, false).unwrap();
        let RetentionOutcome::Applied { deleted } = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(deleted.len(), 4);
        assert!(store::current(&paths, &Target::Local, "api").unwrap().is_some());
    }
}
