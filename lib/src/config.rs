//! Centralized path and edition configuration: well-known paths are
//! collected into one struct rather than scattered as literal strings
//! through the codebase.

use camino::{Utf8Path, Utf8PathBuf};

/// The deployment variant. Every file-and-exec primitive in the revision
/// store takes a [`Target`](crate::target::Target) built from this, rather
/// than the whole verb table being duplicated per edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edition {
    /// `remote-incus`: file and script actions are indirected through a
    /// named container via the container-exec tool.
    Container,
    /// `remote-metal`: actions run directly on the host.
    BareMetal,
}

impl Edition {
    /// The constant string this edition reports for the `edition` verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Edition::Container => "remote-incus",
            Edition::BareMetal => "remote-metal",
        }
    }
}

/// Well-known on-disk locations, rooted at `<agent-root>` (`/opt/run-deploy`
/// by default) and the drop directory (`/tmp/run-deploy` by default).
/// Both roots are overridable via environment variables so tests can point
/// them at a [`tempfile::TempDir`].
#[derive(Debug, Clone)]
pub struct AgentPaths {
    agent_root: Utf8PathBuf,
    drop_dir: Utf8PathBuf,
    queue_dir: Utf8PathBuf,
    sentinel: Utf8PathBuf,
    fifo_root: Utf8PathBuf,
    edition: Edition,
}

impl AgentPaths {
    const DEFAULT_AGENT_ROOT: &'static str = "/opt/run-deploy";
    const DEFAULT_DROP_DIR: &'static str = "/tmp/run-deploy";
    const DEFAULT_QUEUE_DIR: &'static str = "/tmp/run-deploy-queue";
    const DEFAULT_SENTINEL: &'static str = "/tmp/run-deploy.path";
    const DEFAULT_FIFO_ROOT: &'static str = "/tmp";

    /// Build paths from the environment, falling back to the documented
    /// defaults. The edition is derived from the presence of
    /// `<agent-root>/options/metal`.
    pub fn from_env() -> Self {
        let agent_root = std::env::var("RUN_DEPLOY_ROOT")
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|_| Utf8PathBuf::from(Self::DEFAULT_AGENT_ROOT));
        let drop_dir = std::env::var("RUN_DEPLOY_DROP")
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|_| Utf8PathBuf::from(Self::DEFAULT_DROP_DIR));
        Self::new(agent_root, drop_dir)
    }

    /// Build paths rooted at explicit locations (used by tests and by
    /// `from_env`).
    pub fn new(agent_root: Utf8PathBuf, drop_dir: Utf8PathBuf) -> Self {
        let queue_dir = Utf8PathBuf::from(Self::DEFAULT_QUEUE_DIR);
        let sentinel = Utf8PathBuf::from(Self::DEFAULT_SENTINEL);
        let fifo_root = Utf8PathBuf::from(Self::DEFAULT_FIFO_ROOT);
        let edition = if agent_root.join("options").join("metal").exists() {
            Edition::BareMetal
        } else {
            Edition::Container
        };
        Self {
            agent_root,
            drop_dir,
            queue_dir,
            sentinel,
            fifo_root,
            edition,
        }
    }

    /// Override the queue directory and sentinel path (tests only; these
    /// are process-global well-known locations in production).
    pub fn with_queue(mut self, queue_dir: Utf8PathBuf, sentinel: Utf8PathBuf) -> Self {
        self.queue_dir = queue_dir;
        self.sentinel = sentinel;
        self
    }

    /// Override the root directory under which request/reply FIFOs are
    /// created (tests only; `/tmp` in production).
    pub fn with_fifo_root(mut self, fifo_root: Utf8PathBuf) -> Self {
        self.fifo_root = fifo_root;
        self
    }

    /// `<agent-root>`
    pub fn agent_root(&self) -> &Utf8Path {
        &self.agent_root
    }

    /// `<agent-root>/minisign`
    pub fn minisign_dir(&self) -> Utf8PathBuf {
        self.agent_root.join("minisign")
    }

    /// `<agent-root>/permission`
    pub fn permission_dir(&self) -> Utf8PathBuf {
        self.agent_root.join("permission")
    }

    /// `<agent-root>/image/<image>`
    pub fn image_dir(&self, image: &str) -> Utf8PathBuf {
        self.agent_root.join("image").join(image)
    }

    /// `<agent-root>/script/deploy/<image>`
    pub fn deploy_hook(&self, image: &str) -> Utf8PathBuf {
        self.agent_root.join("script").join("deploy").join(image)
    }

    /// `<agent-root>/exec/<cmd>`
    pub fn exec_script(&self, cmd: &str) -> Utf8PathBuf {
        self.agent_root.join("exec").join(cmd)
    }

    /// `<agent-root>/exec`
    pub fn exec_dir(&self) -> Utf8PathBuf {
        self.agent_root.join("exec")
    }

    /// `<agent-root>/options/strict`
    pub fn strict_flag(&self) -> Utf8PathBuf {
        self.agent_root.join("options").join("strict")
    }

    /// Whether strict mode (canonical revision naming) is enabled. Default on.
    pub fn strict_mode(&self) -> bool {
        self.strict_flag().exists()
    }

    /// The drop directory images and tokens land in.
    pub fn drop_dir(&self) -> &Utf8Path {
        &self.drop_dir
    }

    /// The queue marker directory.
    pub fn queue_dir(&self) -> &Utf8Path {
        &self.queue_dir
    }

    /// The sentinel file touched to wake the worker.
    pub fn sentinel(&self) -> &Utf8Path {
        &self.sentinel
    }

    /// The root directory under which request/reply FIFOs are created.
    pub fn fifo_root(&self) -> &Utf8Path {
        &self.fifo_root
    }

    /// The configured edition.
    pub fn edition(&self) -> Edition {
        self.edition
    }
}
