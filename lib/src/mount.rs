//! The squashfs mount tool, treated as a black box: mount read-only, later
//! unmount via `squashfuse`/`umount`.

use camino::Utf8Path;

use crate::task::Task;

/// Mount `image` read-only at `mountpoint` via the external `squashfuse`
/// tool.
pub fn mount_squashfs(image: &Utf8Path, mountpoint: &Utf8Path) -> anyhow::Result<()> {
    Task::new(format!("mount {image}"), "squashfuse")
        .args([image.as_str(), mountpoint.as_str()])
        .run()
}

/// Unmount a mount point previously produced by [`mount_squashfs`].
pub fn unmount(mountpoint: &Utf8Path) -> anyhow::Result<()> {
    Task::new(format!("umount {mountpoint}"), "umount")
        .args([mountpoint.as_str()])
        .run()
}
