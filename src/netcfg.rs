//! Guest network configuration over rtnetlink.
//!
//! Brings up loopback unconditionally, then programs the primary interface
//! (`eth0`) from the host-provided IP configs: MTU, link up, checksum
//! offload off, addresses with NODAD, default routes. Also owns the
//! link-local setup the metadata-service fetch needs before the real
//! network exists.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures_util::TryStreamExt;
use netlink_packet_route::address::AddressMessage;
use netlink_packet_route::link::LinkMessage;
use netlink_packet_route::route::RouteMessage;
use rtnetlink::Handle;
use tracing::warn;

use crate::config::IpConfig;
use crate::error::InitError;

const DEFAULT_MTU: u32 = 1500;
const PRIMARY_INTERFACE: &str = "eth0";

/// IFA_F_NODAD: skip duplicate address detection.
const NODAD: u8 = 0x02;

const MMDS_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);
const MMDS_SOURCE: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 1);
const MMDS_SOURCE_PREFIX: u8 = 16;

fn net_err(what: &str, err: impl std::fmt::Display) -> InitError {
    InitError::NetworkConfigFailed(format!("{what}: {err}"))
}

/// Open an rtnetlink connection, driving it from a background task.
fn connect() -> Result<(tokio::task::JoinHandle<()>, Handle), InitError> {
    let (conn, handle, _) = rtnetlink::new_connection().map_err(|e| net_err("netlink", e))?;
    Ok((tokio::spawn(conn), handle))
}

async fn link_by_name(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, InitError> {
    handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await
        .map_err(|e| net_err(&format!("find {name}"), e))
}

/// Apply the full network configuration.
pub async fn configure(ip_configs: &[IpConfig], mtu: u32) -> Result<(), InitError> {
    let (conn_task, handle) = connect()?;
    let result = configure_inner(&handle, ip_configs, mtu).await;
    conn_task.abort();
    result
}

async fn configure_inner(
    handle: &Handle,
    ip_configs: &[IpConfig],
    mtu: u32,
) -> Result<(), InitError> {
    if let Ok(Some(lo)) = link_by_name(handle, "lo").await {
        let _ = handle.link().set(lo.header.index).up().execute().await;
    }

    if ip_configs.is_empty() {
        return Ok(());
    }

    let eth0 = link_by_name(handle, PRIMARY_INTERFACE)
        .await?
        .ok_or_else(|| net_err(&format!("find {PRIMARY_INTERFACE}"), "no such link"))?;
    let index = eth0.header.index;

    let mtu = if mtu == 0 { DEFAULT_MTU } else { mtu };
    handle
        .link()
        .set(index)
        .mtu(mtu)
        .up()
        .execute()
        .await
        .map_err(|e| net_err(&format!("link up {PRIMARY_INTERFACE} mtu {mtu}"), e))?;

    // Firecracker virtio-net delivers frames with bogus checksums unless
    // offload is off. rx is best-effort, tx must succeed.
    disable_checksums(PRIMARY_INTERFACE)?;

    for ipc in ip_configs {
        add_address(handle, index, ipc).await?;
        add_route(handle, index, ipc).await?;
    }

    Ok(())
}

async fn add_address(handle: &Handle, index: u32, ipc: &IpConfig) -> Result<(), InitError> {
    let ip: IpAddr = ipc
        .ip
        .parse()
        .map_err(|e| net_err(&format!("parse IP {}", ipc.ip), e))?;

    let mut req = handle.address().add(index, ip, ipc.mask);
    req.message_mut().header.flags |= NODAD;
    req.execute()
        .await
        .map_err(|e| net_err(&format!("add addr {}/{}", ipc.ip, ipc.mask), e))
}

async fn add_route(handle: &Handle, index: u32, ipc: &IpConfig) -> Result<(), InitError> {
    // Gateways may arrive in CIDR notation; the prefix is irrelevant here.
    let gw_str = ipc.gateway.split('/').next().unwrap_or(&ipc.gateway);
    let gw: IpAddr = gw_str
        .parse()
        .map_err(|e| net_err(&format!("parse gateway {}", ipc.gateway), e))?;

    let result = match gw {
        IpAddr::V4(gw) => {
            handle
                .route()
                .add()
                .v4()
                .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
                .output_interface(index)
                .gateway(gw)
                .execute()
                .await
        }
        IpAddr::V6(gw) => {
            handle
                .route()
                .add()
                .v6()
                .destination_prefix(Ipv6Addr::UNSPECIFIED, 0)
                .output_interface(index)
                .gateway(gw)
                .execute()
                .await
        }
    };
    result.map_err(|e| net_err(&format!("add route via {gw_str}"), e))
}

/// The exact address and route installed for the metadata fetch, kept so
/// [`cleanup_mmds`] can delete precisely them.
pub struct MmdsNetwork {
    address: AddressMessage,
    route: RouteMessage,
}

/// Bring up the primary interface with a link-local source address and a
/// host route to the metadata endpoint. Firecracker requires both before
/// MMDS answers.
pub async fn setup_mmds() -> Result<MmdsNetwork, InitError> {
    let (conn_task, handle) = connect()?;
    let result = setup_mmds_inner(&handle).await;
    conn_task.abort();
    result
}

async fn setup_mmds_inner(handle: &Handle) -> Result<MmdsNetwork, InitError> {
    let link = link_by_name(handle, PRIMARY_INTERFACE)
        .await?
        .ok_or_else(|| net_err(&format!("mmds: find {PRIMARY_INTERFACE}"), "no such link"))?;
    let index = link.header.index;

    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| net_err("mmds: link up", e))?;

    let mut addr_req = handle
        .address()
        .add(index, IpAddr::V4(MMDS_SOURCE), MMDS_SOURCE_PREFIX);
    addr_req.message_mut().header.flags |= NODAD;
    let address = addr_req.message_mut().clone();
    addr_req
        .execute()
        .await
        .map_err(|e| net_err("mmds: add addr", e))?;

    let mut route_req = handle
        .route()
        .add()
        .v4()
        .destination_prefix(MMDS_IP, 32)
        .output_interface(index);
    let route = route_req.message_mut().clone();
    route_req
        .execute()
        .await
        .map_err(|e| net_err("mmds: add route", e))?;

    Ok(MmdsNetwork { address, route })
}

/// Remove the link-local address and host route again. Best-effort; the
/// real network configuration replaces them either way.
pub async fn cleanup_mmds(network: MmdsNetwork) {
    let Ok((conn_task, handle)) = connect() else {
        return;
    };
    if let Err(e) = handle.route().del(network.route).execute().await {
        warn!(error = %e, "mmds route cleanup failed");
    }
    if let Err(e) = handle.address().del(network.address).execute().await {
        warn!(error = %e, "mmds addr cleanup failed");
    }
    conn_task.abort();
}

const ETHTOOL_SRXCSUM: u32 = 0x0000_0015;
const ETHTOOL_STXCSUM: u32 = 0x0000_0017;

#[repr(C)]
struct EthtoolValue {
    cmd: u32,
    data: u32,
}

#[repr(C)]
struct EthtoolIfreq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_data: *mut libc::c_void,
}

/// Disable rx/tx checksum offload via the ethtool ioctl. tx is required for
/// Firecracker virtio-net; rx failures are ignored.
fn disable_checksums(ifname: &str) -> Result<(), InitError> {
    // SAFETY: socket() takes no pointers; failure is checked below.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Ok(());
    }

    let _ = ethtool_set(fd, ifname, ETHTOOL_SRXCSUM, 0);
    let result = ethtool_set(fd, ifname, ETHTOOL_STXCSUM, 0)
        .map_err(|e| net_err(&format!("disable tx checksum on {ifname}"), e));

    // SAFETY: fd is the socket opened above.
    unsafe { libc::close(fd) };
    result
}

fn ethtool_set(fd: i32, ifname: &str, cmd: u32, value: u32) -> std::io::Result<()> {
    let mut ecmd = EthtoolValue { cmd, data: value };
    // SAFETY: zeroed ifreq is a valid all-zeroes request buffer.
    let mut ifr: EthtoolIfreq = unsafe { std::mem::zeroed() };
    let name = ifname.as_bytes();
    let n = name.len().min(libc::IFNAMSIZ - 1);
    ifr.ifr_name[..n].copy_from_slice(&name[..n]);
    ifr.ifr_data = std::ptr::addr_of_mut!(ecmd).cast();

    // SAFETY: fd is an open socket; ifr and ecmd outlive the call.
    let rc = unsafe { libc::ioctl(fd, libc::SIOCETHTOOL as _, &mut ifr) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
