//! Orderly teardown after the workload exits.
//!
//! Extra mounts are released in reverse of mount order; stubborn ones fall
//! back to a lazy detach. The final kernel restart is how a Firecracker VM
//! terminates.

use std::time::Duration;

use nix::mount::{umount, umount2, MntFlags};
use nix::sys::reboot::{reboot, RebootMode};
use tracing::{info, warn};

use crate::config::Mount;

const UNMOUNT_ATTEMPTS: u32 = 5;
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_millis(750);
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Unmount the extra mounts, flush, and request a kernel restart.
pub async fn shutdown(mounts: &[Mount]) {
    for m in mounts.iter().rev() {
        unmount_with_retry(&m.mount_path).await;
    }

    nix::unistd::sync();

    // Let virtio flush pending writes before the VM disappears.
    tokio::time::sleep(SETTLE_DELAY).await;

    info!("rebooting");
    let _ = reboot(RebootMode::RB_AUTOBOOT);
}

async fn unmount_with_retry(path: &str) {
    for _ in 0..UNMOUNT_ATTEMPTS {
        if umount(path).is_ok() {
            return;
        }
        tokio::time::sleep(UNMOUNT_RETRY_DELAY).await;
    }

    warn!(path, "lazy unmount");
    let _ = umount2(path, MntFlags::MNT_DETACH);
    nix::unistd::sync();
}
