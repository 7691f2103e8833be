mod interface;

pub use interface::*;

use crate::config::{Network, SandboxNetwork};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use nix::ifaddrs::getifaddrs;
use std::net::SocketAddrV4;

const LOOPBACK: &str = "lo";

/// Brings up loopback and, for bridged sandboxes, configures the veth end
/// the host already moved into our namespace.
pub fn setup_network(nettype: Network, network: &SandboxNetwork) -> Result<()> {
    let control = InterfaceControl::new()?;
    control.bring_up(LOOPBACK)?;
    debug!("Loopback interface is up");

    match nettype {
        Network::None | Network::Host => Ok(()),
        Network::Bridge => setup_bridge(&control, network),
    }
}

fn setup_bridge(
    control: &InterfaceControl,
    network: &SandboxNetwork,
) -> Result<()> {
    let ip = network
        .ip
        .ok_or_else(|| anyhow!("Bridge networking requires an address"))?;
    let interface = network.interface.as_str();

    control.set_address(interface, ip)?;
    control.set_netmask(interface, netmask(network.prefix_len)?)?;
    control
        .bring_up(interface)
        .context("failed to bring up bridge interface")?;

    if let Some(gateway) = network.gateway {
        control.add_default_route(gateway)?;
    }

    info!(
        "Configured {} with {}/{}",
        interface, ip, network.prefix_len
    );
    Ok(())
}

pub fn log_interfaces() {
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Unable to list network interfaces: {}", e);
            return;
        }
    };

    for ifaddr in addrs {
        let Some(sin) = ifaddr
            .address
            .as_ref()
            .and_then(|address| address.as_sockaddr_in())
        else {
            continue;
        };
        info!(
            "Interface {} has address {}",
            ifaddr.interface_name,
            SocketAddrV4::from(*sin).ip()
        );
    }
}
