//! Host network allocation for microVMs.
//!
//! Each VM gets a TAP device, a deterministic guest MAC, and a /30 carved
//! out of the allocator's base network: host gateway at `.1`, guest at
//! `.2` of the block. Optionally plumbs NAT towards an uplink interface.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zephyr_core::ports::VmNetwork;
use zephyr_core::{Error, Result};

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base of the address space carved into /30 blocks.
    pub base: Ipv4Addr,
    /// Uplink interface for NAT; `None` leaves guests host-only.
    pub nat_interface: Option<String>,
    /// When false, only bookkeeping happens (no `ip`/`iptables` calls);
    /// used by tests and dry runs.
    pub configure_host: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(172, 30, 0, 0),
            nat_interface: None,
            configure_host: true,
        }
    }
}

#[derive(Debug, Default)]
struct AllocState {
    freed: BTreeSet<u32>,
    next: u32,
}

/// Hands out and reclaims /30 blocks with their TAP devices.
pub struct NetworkAllocator {
    config: NetworkConfig,
    state: Mutex<AllocState>,
}

impl NetworkAllocator {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AllocState::default()),
        }
    }

    /// Allocate the next free block and configure the host side.
    pub async fn allocate(&self) -> Result<VmNetwork> {
        let index = {
            let mut state = self.state.lock().await;
            match state.freed.pop_first() {
                Some(index) => index,
                None => {
                    let index = state.next;
                    state.next += 1;
                    index
                }
            }
        };

        let network = self.network_for(index);
        if self.config.configure_host {
            if let Err(e) = self.configure_tap(&network).await {
                self.state.lock().await.freed.insert(index);
                return Err(e);
            }
        }
        debug!(tap = %network.tap_device, guest = %network.guest_ip, "Allocated VM network");
        Ok(network)
    }

    /// Tear down the host side and reclaim the block.
    pub async fn release(&self, network: &VmNetwork) -> Result<()> {
        if self.config.configure_host {
            if let Err(e) = self.teardown_tap(network).await {
                warn!(tap = %network.tap_device, error = %e, "TAP teardown failed");
            }
        }
        self.state.lock().await.freed.insert(network.index);
        Ok(())
    }

    fn network_for(&self, index: u32) -> VmNetwork {
        let base = u32::from(self.config.base);
        let block = base + index * 4;
        VmNetwork {
            tap_device: format!("zeph-tap{}", index),
            guest_mac: format!("AA:FC:00:00:{:02X}:{:02X}", (index >> 8) & 0xFF, index & 0xFF),
            gateway_ip: Ipv4Addr::from(block + 1),
            guest_ip: Ipv4Addr::from(block + 2),
            index,
        }
    }

    async fn configure_tap(&self, network: &VmNetwork) -> Result<()> {
        run_ip(&["tuntap", "add", &network.tap_device, "mode", "tap"]).await?;
        run_ip(&[
            "addr",
            "add",
            &format!("{}/30", network.gateway_ip),
            "dev",
            &network.tap_device,
        ])
        .await?;
        run_ip(&["link", "set", &network.tap_device, "up"]).await?;

        if let Some(uplink) = &self.config.nat_interface {
            let subnet = format!("{}/30", Ipv4Addr::from(u32::from(network.gateway_ip) - 1));
            run_cmd(
                "iptables",
                &[
                    "-t",
                    "nat",
                    "-A",
                    "POSTROUTING",
                    "-s",
                    &subnet,
                    "-o",
                    uplink,
                    "-j",
                    "MASQUERADE",
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn teardown_tap(&self, network: &VmNetwork) -> Result<()> {
        if let Some(uplink) = &self.config.nat_interface {
            let subnet = format!("{}/30", Ipv4Addr::from(u32::from(network.gateway_ip) - 1));
            let _ = run_cmd(
                "iptables",
                &[
                    "-t",
                    "nat",
                    "-D",
                    "POSTROUTING",
                    "-s",
                    &subnet,
                    "-o",
                    uplink,
                    "-j",
                    "MASQUERADE",
                ],
            )
            .await;
        }
        run_ip(&["tuntap", "del", &network.tap_device, "mode", "tap"]).await
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    run_cmd("ip", args).await
}

async fn run_cmd(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::NetworkAllocFailure(format!("{program} invocation failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::NetworkAllocFailure(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> NetworkAllocator {
        NetworkAllocator::new(NetworkConfig {
            base: Ipv4Addr::new(172, 30, 0, 0),
            nat_interface: None,
            configure_host: false,
        })
    }

    #[tokio::test]
    async fn test_sequential_slash_30_blocks() {
        let alloc = allocator();
        let first = alloc.allocate().await.unwrap();
        let second = alloc.allocate().await.unwrap();

        assert_eq!(first.gateway_ip, Ipv4Addr::new(172, 30, 0, 1));
        assert_eq!(first.guest_ip, Ipv4Addr::new(172, 30, 0, 2));
        assert_eq!(second.gateway_ip, Ipv4Addr::new(172, 30, 0, 5));
        assert_eq!(second.guest_ip, Ipv4Addr::new(172, 30, 0, 6));
        assert_ne!(first.tap_device, second.tap_device);
        assert_ne!(first.guest_mac, second.guest_mac);
    }

    #[tokio::test]
    async fn test_released_blocks_are_reused() {
        let alloc = allocator();
        let first = alloc.allocate().await.unwrap();
        let _second = alloc.allocate().await.unwrap();
        alloc.release(&first).await.unwrap();

        let third = alloc.allocate().await.unwrap();
        assert_eq!(third.index, first.index);
        assert_eq!(third.guest_ip, first.guest_ip);
    }
}
