use crate::config::{CgroupConfig, JailConfig};
use crate::errors::{SandboxError, SandboxResult};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use std::fs::{DirBuilder, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Character devices bind mounted into every sandbox's `/dev`.
pub const DEVICE_NODES: &[DeviceNode] = &[
    DeviceNode::new("null", 1, 3),
    DeviceNode::new("zero", 1, 5),
    DeviceNode::new("random", 1, 8),
    DeviceNode::new("urandom", 1, 9),
];

pub const CGROUP_CONTROLLERS: &[&str] = &["memory", "pids", "cpu"];

const DEVICE_MODE: u32 = 0o666;
const TMP_DIR_MODE: u32 = 0o775;

#[derive(Clone, Copy, Debug)]
pub struct DeviceNode {
    pub name: &'static str,
    pub major: u64,
    pub minor: u64,
}

impl DeviceNode {
    const fn new(name: &'static str, major: u64, minor: u64) -> Self {
        Self { name, major, minor }
    }
}

/// Prepares the host resources shared by all sandboxes. Safe to call again.
pub fn provision(config: &JailConfig) -> SandboxResult<()> {
    ensure_tmp_dir(&config.tmp_dir)?;
    ensure_device_nodes(&config.tmp_dir, config.uid_start, config.gid_start)?;
    ensure_cgroup_parents(&config.cgroups)?;
    info!(
        "provisioned jail resources in {} (cgroup parent {})",
        config.tmp_dir.display(),
        config.cgroups.name
    );
    Ok(())
}

pub fn ensure_tmp_dir(path: &Path) -> SandboxResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(TMP_DIR_MODE)
        .create(path)
        .map_err(|source| provision_error(path, source))
}

pub fn ensure_device_nodes(dir: &Path, uid: u32, gid: u32) -> SandboxResult<()> {
    for node in DEVICE_NODES {
        let path = dir.join(node.name);
        ensure_device_node(&path, node)?;
        chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|errno| provision_error(&path, errno.into()))?;
    }
    Ok(())
}

fn ensure_device_node(path: &Path, node: &DeviceNode) -> SandboxResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_char_device() => {
            debug!("device node {} already present", path.display());
            return Ok(());
        }
        Ok(_) => {
            return Err(provision_error(
                path,
                std::io::Error::new(ErrorKind::AlreadyExists, "exists but is not a character device"),
            ));
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(provision_error(path, error)),
    }

    mknod(
        path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(DEVICE_MODE),
        makedev(node.major, node.minor),
    )
    .map_err(|errno| provision_error(path, errno.into()))?;

    // mknod honours the umask
    std::fs::set_permissions(path, Permissions::from_mode(DEVICE_MODE))
        .map_err(|source| provision_error(path, source))?;
    debug!(
        "created device node {} ({}:{})",
        path.display(),
        node.major,
        node.minor
    );
    Ok(())
}

pub fn ensure_cgroup_parents(cgroups: &CgroupConfig) -> SandboxResult<Vec<PathBuf>> {
    let mut created = Vec::with_capacity(CGROUP_CONTROLLERS.len());
    for controller in CGROUP_CONTROLLERS {
        let controller_root = cgroups.root.join(controller);
        if !controller_root.is_dir() {
            return Err(SandboxError::CgroupControllerUnavailable(
                (*controller).to_string(),
            ));
        }

        let parent = controller_root.join(&cgroups.name);
        std::fs::create_dir_all(&parent).map_err(|source| provision_error(&parent, source))?;
        created.push(parent);
    }
    Ok(created)
}

fn provision_error(path: &Path, source: std::io::Error) -> SandboxError {
    SandboxError::Provision {
        path: path.to_path_buf(),
        source,
    }
}
