//! `Target`: the one sum type every file-and-exec primitive in the revision
//! store dispatches on, instead of duplicating the whole verb table per
//! edition. `Container` indirects through the external `incus` binary
//! (`incus exec ...`, `incus file push ...`); `Local` performs the
//! equivalent direct filesystem/subprocess operation.

use camino::{Utf8Path, Utf8PathBuf};

use crate::task::{Task, TaskOutput};

/// The deployment target a revision-store operation acts on.
#[derive(Debug, Clone)]
pub enum Target {
    /// Container edition: the named container receives all file and script
    /// actions via the container-exec tool.
    Container(String),
    /// Bare-metal edition: actions run directly on the host.
    Local,
}

impl Target {
    /// Run `argv` (with an optional working directory) against the target,
    /// capturing output rather than inheriting it.
    pub fn exec(&self, cwd: Option<&Utf8Path>, argv: &[&str]) -> anyhow::Result<TaskOutput> {
        match self {
            Target::Container(name) => {
                let mut task = Task::new(format!("incus exec {name}"), "incus").args(["exec", name]);
                if let Some(cwd) = cwd {
                    task = task.args(["--cwd", cwd.as_str()]);
                }
                task = task.args(["--"]).args(argv);
                task.run_captured()
            }
            Target::Local => {
                let (exe, rest) = argv.split_first().ok_or_else(|| anyhow::anyhow!("empty argv"))?;
                let mut task = Task::new(format!("exec {exe}"), exe).args(rest);
                if let Some(cwd) = cwd {
                    task = task.current_dir(cwd.as_std_path());
                }
                task.run_captured()
            }
        }
    }

    /// Probe that the target is reachable / exists. Always true for
    /// bare-metal; for a container, a trivial `exec` confirming it exists.
    pub fn probe_exists(&self) -> bool {
        match self {
            Target::Container(_) => self
                .exec(None, &["true"])
                .map(|o| o.success())
                .unwrap_or(false),
            Target::Local => true,
        }
    }

    /// `mkdir -p` the given path on the target.
    pub fn mkdir_p(&self, path: &Utf8Path) -> anyhow::Result<()> {
        match self {
            Target::Container(_) => {
                self.exec(None, &["mkdir", "-p", path.as_str()])?;
                Ok(())
            }
            Target::Local => {
                std::fs::create_dir_all(path)?;
                Ok(())
            }
        }
    }

    /// Copy a local file into the target at `dest`, setting root ownership
    /// where that's meaningful.
    pub fn install_file(&self, local_src: &Utf8Path, dest: &Utf8Path) -> anyhow::Result<()> {
        match self {
            Target::Container(name) => {
                let out = Task::new(
                    format!("incus file push {local_src} -> {name}{dest}"),
                    "incus",
                )
                .args([
                    "file",
                    "push",
                    "--uid",
                    "0",
                    "--gid",
                    "0",
                    local_src.as_str(),
                    &format!("{name}{dest}"),
                ])
                .run_captured()?;
                if !out.success() {
                    anyhow::bail!("incus file push failed: {}", out.stderr);
                }
                Ok(())
            }
            Target::Local => {
                std::fs::copy(local_src, dest)?;
                // Best-effort; non-root test runs can't chown and that's fine.
                let _ = rustix::fs::chown(
                    dest.as_std_path(),
                    Some(rustix::fs::Uid::ROOT),
                    Some(rustix::fs::Gid::ROOT),
                );
                Ok(())
            }
        }
    }

    /// Mark a file on the target as executable (mode 0755).
    pub fn make_executable(&self, path: &Utf8Path) -> anyhow::Result<()> {
        match self {
            Target::Container(_) => {
                self.exec(None, &["chmod", "0755", path.as_str()])?;
                Ok(())
            }
            Target::Local => {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
                Ok(())
            }
        }
    }

    /// Read the UTF-8 contents of a file on the target, trimmed.
    pub fn read_to_string(&self, path: &Utf8Path) -> anyhow::Result<String> {
        match self {
            Target::Container(_) => {
                let out = self.exec(None, &["cat", path.as_str()])?;
                if !out.success() {
                    anyhow::bail!("cat {path} failed: {}", out.stderr);
                }
                Ok(out.stdout)
            }
            Target::Local => Ok(std::fs::read_to_string(path)?.trim().to_string()),
        }
    }

    /// Resolve a symlink on the target to its canonical target path.
    pub fn read_link_canonical(&self, path: &Utf8Path) -> anyhow::Result<Option<Utf8PathBuf>> {
        match self {
            Target::Container(_) => {
                let out = self.exec(None, &["realpath", path.as_str()])?;
                if !out.success() {
                    return Ok(None);
                }
                Ok(Some(Utf8PathBuf::from(out.stdout)))
            }
            Target::Local => {
                if !path.exists() {
                    return Ok(None);
                }
                let canon = std::fs::canonicalize(path)?;
                Ok(Some(Utf8PathBuf::from_path_buf(canon).map_err(|p| {
                    anyhow::anyhow!("non-utf8 path: {}", p.display())
                })?))
            }
        }
    }

    /// List the base names of files matching `*.blame` inside `dir`.
    pub fn list_blame_files(&self, dir: &Utf8Path) -> anyhow::Result<Vec<String>> {
        match self {
            Target::Container(_) => {
                let out = self.exec(
                    Some(dir),
                    &["sh", "-c", "for f in *.blame; do [ -e \"$f\" ] && echo \"$f\"; done"],
                )?;
                if !out.success() {
                    anyhow::bail!("listing blame files failed: {}", out.stderr);
                }
                Ok(out.stdout.lines().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            }
            Target::Local => {
                let mut names = Vec::new();
                if !dir.exists() {
                    return Ok(names);
                }
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.ends_with(".blame") {
                        names.push(name.to_string());
                    }
                }
                Ok(names)
            }
        }
    }

    /// List the base names of every entry directly inside `dir` (files and
    /// directories alike — used both for `image/` subdirectories, which are
    /// always directories, and `exec/` scripts, which are always files).
    pub fn list_dir_names(&self, dir: &Utf8Path) -> anyhow::Result<Vec<String>> {
        match self {
            Target::Container(_) => {
                let out = self.exec(
                    Some(dir),
                    &["sh", "-c", "for f in *; do [ -e \"$f\" ] && echo \"$f\"; done"],
                )?;
                if !out.success() {
                    anyhow::bail!("listing '{dir}' failed: {}", out.stderr);
                }
                Ok(out.stdout.lines().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            }
            Target::Local => {
                let mut names = Vec::new();
                if !dir.exists() {
                    return Ok(names);
                }
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    names.push(entry.file_name().to_string_lossy().to_string());
                }
                Ok(names)
            }
        }
    }

    /// Atomically point `link_name` (inside `dir`) at `target_name`, using
    /// the create-a-tmp-symlink-then-rename-over-it pattern rather than a
    /// bare `ln -sf` (on some filesystems that's unlink+symlink, not atomic).
    pub fn atomic_symlink(&self, dir: &Utf8Path, link_name: &str, target_name: &str) -> anyhow::Result<()> {
        match self {
            Target::Container(_) => {
                let tmp_name = format!("{link_name}.tmp");
                let script = format!(
                    "cd {dir} && ln -sfn {target_name} {tmp_name} && mv -T {tmp_name} {link_name}"
                );
                let out = self.exec(None, &["sh", "-c", &script])?;
                if !out.success() {
                    anyhow::bail!("atomic symlink swap failed: {}", out.stderr);
                }
                Ok(())
            }
            Target::Local => {
                let tmp_path = dir.join(format!("{link_name}.tmp"));
                let link_path = dir.join(link_name);
                let _ = std::fs::remove_file(&tmp_path);
                std::os::unix::fs::symlink(target_name, &tmp_path)?;
                std::fs::rename(&tmp_path, &link_path)?;
                // fsync the containing directory so the rename is durable
                // before we report success.
                if let Ok(dirfile) = std::fs::File::open(dir) {
                    let _ = dirfile.sync_all();
                }
                Ok(())
            }
        }
    }

    /// Run an activation script already installed on the target, with no
    /// arguments, returning its captured output.
    pub fn run_script(&self, path: &Utf8Path) -> anyhow::Result<TaskOutput> {
        self.exec(None, &[path.as_str()])
    }

    /// Delete a file on the target if present.
    pub fn remove_file(&self, path: &Utf8Path) -> anyhow::Result<()> {
        match self {
            Target::Container(_) => {
                self.exec(None, &["rm", "-f", path.as_str()])?;
                Ok(())
            }
            Target::Local => {
                let _ = std::fs::remove_file(path);
                Ok(())
            }
        }
    }

    /// Whether a path exists on the target.
    pub fn exists(&self, path: &Utf8Path) -> bool {
        match self {
            Target::Container(_) => self
                .exec(None, &["test", "-e", path.as_str()])
                .map(|o| o.success())
                .unwrap_or(false),
            Target::Local => path.exists(),
        }
    }
}

/// List the names of all containers known to the container-exec tool, for
/// the `list-incus` verb. This is edition-level information (not scoped to
/// any one [`Target`]), so it's a free function rather than a `Target` method.
pub fn list_incus_containers() -> anyhow::Result<Vec<String>> {
    let out = Task::new("incus list", "incus")
        .args(["list", "-f", "csv", "-c", "n"])
        .run_captured()?;
    if !out.success() {
        anyhow::bail!("incus list failed: {}", out.stderr);
    }
    Ok(out.stdout.lines().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_list_dir_names_lists_files_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        std::fs::write(dir.join("init"), b"#!/bin/sh\n").unwrap();
        std::fs::create_dir(dir.join("api")).unwrap();
        let mut names = Target::Local.list_dir_names(&dir).unwrap();
        names.sort();
        assert_eq!(names, vec!["api", "init"]);
    }

    #[test]
    fn local_atomic_symlink_points_at_target() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        std::fs::write(dir.join("rev1.squashfs"), b"v1").unwrap();
        let target = Target::Local;
        target.atomic_symlink(&dir, "api.squashfs", "rev1.squashfs").unwrap();
        let resolved = target.read_link_canonical(&dir.join("api.squashfs")).unwrap().unwrap();
        assert_eq!(resolved.file_name().unwrap(), "rev1.squashfs");
    }

    #[test]
    fn local_atomic_symlink_repoints_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        std::fs::write(dir.join("rev1.squashfs"), b"v1").unwrap();
        std::fs::write(dir.join("rev2.squashfs"), b"v2").unwrap();
        let target = Target::Local;
        target.atomic_symlink(&dir, "api.squashfs", "rev1.squashfs").unwrap();
        target.atomic_symlink(&dir, "api.squashfs", "rev2.squashfs").unwrap();
        let resolved = target.read_link_canonical(&dir.join("api.squashfs")).unwrap().unwrap();
        assert_eq!(resolved.file_name().unwrap(), "rev2.squashfs");
    }

    #[test]
    fn local_list_blame_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        std::fs::write(dir.join("a.blame"), b"x").unwrap();
        std::fs::write(dir.join("b.blame"), b"y").unwrap();
        std::fs::write(dir.join("c.squashfs"), b"z").unwrap();
        let mut names = Target::Local.list_blame_files(&dir).unwrap();
        names.sort();
        assert_eq!(names, vec!["a.blame", "b.blame"]);
    }
}
