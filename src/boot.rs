//! Boot pipeline: the ordered mount/pivot sequence that takes the VM from
//! the initramfs to a usable root filesystem.
//!
//! Phases run in strict order from `main`. Fatal phases return an error and
//! the VM halts; advisory phases log and continue.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{chdir, chroot};
use tracing::warn;

use crate::error::InitError;

const NEWROOT: &str = "/newroot";
const CONSOLE: &std::ffi::CStr = c"/dev/ttyS0";

/// Initramfs directory holding the run config; removed once consumed.
pub const CONFIG_DIR: &str = "/pigeon";

/// Open-file limit for init and everything it spawns.
const NOFILE_LIMIT: u64 = 10240;

fn mkdir(path: &str, mode: u32) -> Result<(), InitError> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| InitError::mount(path, format!("mkdir: {e}")))
}

/// Mount the early devtmpfs at `/dev` so the root device node exists.
pub fn mount_dev() -> Result<(), InitError> {
    mkdir("/dev", 0o755)?;
    mount(
        Some("devtmpfs"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=0755"),
    )
    .map_err(|e| InitError::mount("/dev", e))
}

/// Rebind stdin/stdout/stderr to the serial console.
///
/// Advisory: a VM launched without a serial device simply keeps the kernel's
/// fds.
pub fn setup_console() {
    // SAFETY: CONSOLE is a valid NUL-terminated string; dup2/close operate
    // on the fd open just returned.
    unsafe {
        let fd = libc::open(CONSOLE.as_ptr(), libc::O_RDWR);
        if fd < 0 {
            return;
        }
        for target in 0..=2 {
            libc::dup2(fd, target);
        }
        if fd > 2 {
            libc::close(fd);
        }
    }
}

/// Mount the configured root device at the staging root.
pub fn mount_rootfs(device: &str) -> Result<(), InitError> {
    mkdir(NEWROOT, 0o755)?;
    mount(
        Some(device),
        NEWROOT,
        Some("ext4"),
        MsFlags::MS_RELATIME,
        None::<&str>,
    )
    .map_err(|e| InitError::mount(NEWROOT, format!("{device}: {e}")))
}

/// Move the live `/dev` mount onto the new root.
pub fn move_dev() -> Result<(), InitError> {
    let dst = format!("{NEWROOT}/dev");
    mkdir(&dst, 0o755)?;
    mount(
        Some("/dev"),
        dst.as_str(),
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| InitError::mount(dst, e))
}

/// Best-effort removal of the initramfs config directory.
pub fn remove_config() {
    let _ = std::fs::remove_dir_all(CONFIG_DIR);
}

/// Make the staging root the real root: chdir, move-mount onto `/`, chroot.
pub fn switch_root() -> Result<(), InitError> {
    chdir(NEWROOT).map_err(|e| InitError::PivotFailed(format!("chdir {NEWROOT}: {e}")))?;
    mount(
        Some("."),
        "/",
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| InitError::PivotFailed(format!("move . onto /: {e}")))?;
    chroot(".").map_err(|e| InitError::PivotFailed(format!("chroot: {e}")))?;
    chdir("/").map_err(|e| InitError::PivotFailed(format!("chdir /: {e}")))?;
    Ok(())
}

struct EssentialMount {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    flags: MsFlags,
    data: Option<&'static str>,
    dir_mode: u32,
}

fn essential_mounts() -> [EssentialMount; 8] {
    [
        EssentialMount {
            source: "devpts",
            target: "/dev/pts",
            fstype: "devpts",
            flags: MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NOATIME,
            data: Some("mode=0620,gid=5,ptmxmode=666"),
            dir_mode: 0o755,
        },
        EssentialMount {
            source: "mqueue",
            target: "/dev/mqueue",
            fstype: "mqueue",
            flags: MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            data: None,
            dir_mode: 0o755,
        },
        EssentialMount {
            source: "tmpfs",
            target: "/dev/shm",
            fstype: "tmpfs",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            data: None,
            dir_mode: 0o1777,
        },
        EssentialMount {
            source: "hugetlbfs",
            target: "/dev/hugepages",
            fstype: "hugetlbfs",
            flags: MsFlags::MS_RELATIME,
            data: Some("pagesize=2M"),
            dir_mode: 0o755,
        },
        EssentialMount {
            source: "proc",
            target: "/proc",
            fstype: "proc",
            flags: MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            data: None,
            dir_mode: 0o555,
        },
        EssentialMount {
            source: "binfmt_misc",
            target: "/proc/sys/fs/binfmt_misc",
            fstype: "binfmt_misc",
            flags: MsFlags::MS_NODEV
                .union(MsFlags::MS_NOEXEC)
                .union(MsFlags::MS_NOSUID)
                .union(MsFlags::MS_RELATIME),
            data: None,
            dir_mode: 0o555,
        },
        EssentialMount {
            source: "sysfs",
            target: "/sys",
            fstype: "sysfs",
            flags: MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            data: None,
            dir_mode: 0o555,
        },
        EssentialMount {
            source: "tmpfs",
            target: "/run",
            fstype: "tmpfs",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            data: Some("mode=0755"),
            dir_mode: 0o755,
        },
    ]
}

/// Mount the essential pseudo-filesystems on the new root, in table order,
/// and lay down the standard `/dev` fd symlinks.
pub fn mount_essential() -> Result<(), InitError> {
    for m in essential_mounts() {
        mkdir(m.target, m.dir_mode)?;
        mount(Some(m.source), m.target, Some(m.fstype), m.flags, m.data)
            .map_err(|e| InitError::mount(m.target, format!("{}: {e}", m.fstype)))?;
    }

    mkdir("/run/lock", 0o1777)?;
    mkdir("/root", 0o700)?;

    let symlinks = [
        ("/proc/self/fd", "/dev/fd"),
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
    ];
    for (target, link) in symlinks {
        let _ = std::fs::remove_file(link);
        std::os::unix::fs::symlink(target, link)
            .map_err(|e| InitError::mount(link, format!("symlink {target}: {e}")))?;
    }

    Ok(())
}

/// Legacy v1 controllers mounted below the cgroup tmpfs.
const CGROUP_V1_CONTROLLERS: [&str; 10] = [
    "net_cls,net_prio",
    "hugetlb",
    "pids",
    "freezer",
    "cpu,cpuacct",
    "devices",
    "blkio",
    "memory",
    "perf_event",
    "cpuset",
];

/// Mount the cgroup hierarchy: tmpfs base, unified v2 at `unified`, then the
/// legacy v1 controllers. Per-controller failures are advisory (the kernel
/// may not ship every controller).
pub fn mount_cgroups() -> Result<(), InitError> {
    let base = "/sys/fs/cgroup";
    let flags =
        MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_RELATIME;

    mkdir(base, 0o555)?;
    mount(
        Some("tmpfs"),
        base,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        Some("mode=755"),
    )
    .map_err(|e| InitError::mount(base, format!("tmpfs: {e}")))?;

    let unified = format!("{base}/unified");
    mkdir(&unified, 0o555)?;
    mount(
        Some("cgroup2"),
        unified.as_str(),
        Some("cgroup2"),
        flags,
        Some("nsdelegate"),
    )
    .map_err(|e| InitError::mount(unified, format!("cgroup2: {e}")))?;

    for ctrl in CGROUP_V1_CONTROLLERS {
        let dir = format!("{base}/{ctrl}");
        mkdir(&dir, 0o555)?;
        if let Err(e) = mount(Some("cgroup"), dir.as_str(), Some("cgroup"), flags, Some(ctrl)) {
            warn!(controller = ctrl, error = %e, "cgroup controller mount failed");
        }
    }

    Ok(())
}

/// Raise the open-file limit for init and its descendants.
pub fn set_rlimits() -> std::io::Result<()> {
    setrlimit(Resource::RLIMIT_NOFILE, NOFILE_LIMIT, NOFILE_LIMIT).map_err(std::io::Error::from)
}

/// Mount the configured extra block devices and hand them to the workload
/// identity. Mount failures are fatal; the chown is advisory.
pub fn mount_extra(
    mounts: &[crate::config::Mount],
    uid: u32,
    gid: u32,
) -> Result<(), InitError> {
    for m in mounts {
        mkdir(&m.mount_path, 0o755)?;
        mount(
            Some(m.device_path.as_str()),
            m.mount_path.as_str(),
            Some("ext4"),
            MsFlags::MS_RELATIME,
            None::<&str>,
        )
        .map_err(|e| InitError::mount(&m.mount_path, format!("{}: {e}", m.device_path)))?;

        if let Err(e) = nix::unistd::chown(
            Path::new(&m.mount_path),
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        ) {
            warn!(path = %m.mount_path, error = %e, "chown mount failed");
        }
    }
    Ok(())
}
