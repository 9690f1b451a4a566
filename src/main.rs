//! PID 1 init for Firecracker micro-VMs.
//!
//! Boot sequence:
//! 1. Mount the early devtmpfs and rebind stdio to the serial console
//! 2. Load the run config (MMDS with a file fallback)
//! 3. Mount the real root, move `/dev` over, switch root
//! 4. Mount essential pseudo-filesystems and the cgroup hierarchy
//! 5. Resolve the workload identity and assemble argv/env
//! 6. Start the vsock control server
//! 7. Extra mounts, /etc files, network bring-up
//! 8. Start the workload and reap until it exits
//! 9. Unmount, sync, and ask the kernel to restart (= VM termination)
//!
//! Any fatal step logs and requests a kernel restart; the hypervisor treats
//! that as the VM ending.

mod boot;
mod config;
mod error;
mod etc;
mod exec;
mod fdio;
mod mmds;
mod netcfg;
mod server;
mod shutdown;
mod supervisor;
mod user;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::error::InitError;

const CONFIG_PATH: &str = "/pigeon/run.json";
const MMDS_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = boot::mount_dev() {
        fatal("mount dev", &e);
    }

    boot::setup_console();
    init_tracing();
    info!("init starting");

    let cfg = match load_config().await {
        Ok(cfg) => cfg,
        Err(e) => fatal("load config", &e),
    };

    if let Err(e) = boot::mount_rootfs(cfg.root_dev()) {
        fatal("mount rootfs", &e);
    }
    if let Err(e) = boot::move_dev() {
        fatal("move dev", &e);
    }
    boot::remove_config();
    if let Err(e) = boot::switch_root() {
        fatal("switch root", &e);
    }
    if let Err(e) = boot::mount_essential() {
        fatal("mount essential", &e);
    }
    if let Err(e) = boot::mount_cgroups() {
        fatal("mount cgroups", &e);
    }
    if let Err(e) = boot::set_rlimits() {
        warn!(error = %e, "set rlimits failed");
    }

    // Image user applies only when no explicit override is set.
    let user_spec = cfg
        .user_override
        .clone()
        .or_else(|| {
            cfg.image_config
                .as_ref()
                .filter(|ic| !ic.user.is_empty())
                .map(|ic| ic.user.clone())
        })
        .unwrap_or_else(|| "root".to_string());
    let identity = match user::resolve(&user_spec) {
        Ok(identity) => identity,
        Err(e) => fatal("resolve user", &e),
    };
    info!(
        uid = identity.uid,
        gid = identity.gid,
        home = %identity.home,
        "resolved user"
    );

    let image = cfg.image_config.clone().unwrap_or_default();
    let env = server::build_env(&image.env, &cfg.extra_env, &identity.home);

    // Export PATH into init's own environment so spawn lookups use the
    // workload's search path.
    if let Some(path) = env.iter().find_map(|e| e.strip_prefix("PATH=")) {
        std::env::set_var("PATH", path);
    }

    let argv = server::build_argv(
        &cfg.exec_override,
        &image.entrypoint,
        &image.cmd,
        cfg.cmd_override.as_deref(),
    );

    let sup = match supervisor::Supervisor::new(argv, &env, &image.working_dir, &identity) {
        Ok(sup) => Arc::new(sup),
        Err(e) => fatal("create supervisor", &e),
    };

    let shutdown_token = CancellationToken::new();
    let api = server::ApiServer::new(sup.clone(), env);
    {
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            if let Err(e) = api.serve(token).await {
                warn!(error = %e, "vsock API error");
            }
        });
    }

    if let Err(e) = boot::mount_extra(&cfg.mounts, identity.uid, identity.gid) {
        fatal("mount extra", &e);
    }

    let etc_dir = Path::new("/etc");
    if let Err(e) = etc::set_hostname(etc_dir, &cfg.hostname) {
        warn!(error = %e, "set hostname failed");
    }
    if let Err(e) = etc::write_hosts(etc_dir, &cfg.etc_hosts) {
        warn!(error = %e, "write /etc/hosts failed");
    }
    if let Err(e) = etc::write_resolv(etc_dir, cfg.etc_resolv.as_ref()) {
        warn!(error = %e, "write /etc/resolv.conf failed");
    }

    if let Err(e) = netcfg::configure(&cfg.ip_configs, cfg.mtu).await {
        fatal("configure network", &e);
    }

    if let Err(e) = sup.start() {
        fatal("start workload", &e);
    }

    let result = match sup.run().await {
        Ok(result) => result,
        Err(e) => fatal("run workload", &e),
    };
    info!(
        exit_code = result.exit_code,
        oom_killed = result.oom_killed,
        "workload exited"
    );

    shutdown_token.cancel();
    shutdown::shutdown(&cfg.mounts).await;
}

/// Prefer MMDS, fall back to the config file the initramfs ships.
async fn load_config() -> Result<RunConfig, InitError> {
    let mmds_net = match netcfg::setup_mmds().await {
        Ok(net) => net,
        Err(e) => {
            debug!(error = %e, "mmds network setup failed, using config file");
            return RunConfig::load(CONFIG_PATH);
        }
    };

    let fetched = mmds::fetch(MMDS_TIMEOUT).await;
    netcfg::cleanup_mmds(mmds_net).await;

    match fetched {
        Ok(cfg) => {
            info!("config loaded from MMDS");
            Ok(cfg)
        }
        Err(e) => {
            debug!(error = %e, "mmds fetch failed, using config file");
            RunConfig::load(CONFIG_PATH)
        }
    }
}

/// Records go to stderr, which is the serial console after the rebind.
fn init_tracing() {
    let level = if std::env::var("INIT_LOG_LEVEL").is_ok_and(|v| v == "debug") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Log the failure and halt the VM via kernel restart.
fn fatal(msg: &str, err: &dyn std::fmt::Display) -> ! {
    error!(error = %err, "{msg}");
    let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT);
    std::process::exit(1);
}
