//! Mount controller: claims the mount point, opens the control channel,
//! drives the request loop, and converges on one teardown sequence no matter
//! how the loop ends.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;

use anyhow::Context;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{getgid, getuid};
use tracing::{debug, info, warn};

use crate::provider::BlockProvider;
use crate::session::Session;
use crate::store::{self, BlockStore};

pub struct MountOptions {
    /// Memory left alone for the co-resident updater when sizing the
    /// retention cache.
    pub reserved_memory: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            reserved_memory: store::DEFAULT_RESERVED_MEMORY,
        }
    }
}

/// Mount the package filesystem at `mount_point` and serve requests until
/// the exit flag is touched. The provider is closed and the mount point
/// detached on every exit path; the result reflects only the request loop.
pub fn run(
    provider: &mut dyn BlockProvider,
    mount_point: &Path,
    options: &MountOptions,
) -> anyhow::Result<()> {
    // A previous instance may have died without unmounting.
    let _ = umount2(mount_point, MntFlags::MNT_FORCE);

    let result = serve(provider, mount_point, options);

    provider.close();
    if let Err(err) = umount2(mount_point, MntFlags::MNT_DETACH) {
        warn!("unmount of {} failed: {err}", mount_point.display());
    }
    result
}

fn serve(
    provider: &mut dyn BlockProvider,
    mount_point: &Path,
    options: &MountOptions,
) -> anyhow::Result<()> {
    let file_size = provider.file_size();
    let block_size = provider.block_size();

    let cache_capacity = store::plan_cache(
        store::free_memory(),
        file_size,
        block_size,
        options.reserved_memory,
    );
    match cache_capacity {
        Some(capacity) => debug!("retention cache sized to {capacity} blocks"),
        None => debug!("not enough free memory for a retention cache"),
    }
    let store = BlockStore::new(file_size, block_size, cache_capacity)?;

    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/fuse")
        .context("open /dev/fuse")?;

    let uid = getuid().as_raw();
    let gid = getgid().as_raw();
    let opts = mount_data(control.as_raw_fd(), uid, gid, block_size);
    mount(
        Some("/dev/fuse"),
        mount_point,
        Some("fuse"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC,
        Some(opts.as_str()),
    )
    .with_context(|| format!("mount on {}", mount_point.display()))?;
    info!(
        "serving {} bytes in {} blocks at {}",
        file_size,
        store.block_count(),
        mount_point.display()
    );

    Session::new(control, provider, store, uid, gid).run()
}

fn mount_data(fd: i32, uid: u32, gid: u32, block_size: u32) -> String {
    format!(
        "fd={fd},user_id={uid},group_id={gid},max_read={block_size},allow_other,rootmode=040000"
    )
}
