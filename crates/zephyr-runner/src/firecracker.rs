//! Firecracker hypervisor driver.
//!
//! Talks to each VMM process over its API socket. The control plane is
//! small: configure boot source, machine, root drive, and network, then
//! `InstanceStart`. Teardown signals the VMM process and removes the
//! socket.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zephyr_core::ids::VmId;
use zephyr_core::ports::{HypervisorDriver, VmSpec};
use zephyr_core::{Error, Result};

const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

struct VmProcess {
    child: Child,
    socket_path: PathBuf,
}

/// Driver that spawns one `firecracker` process per VM.
pub struct FirecrackerDriver {
    socket_dir: PathBuf,
    processes: Mutex<HashMap<VmId, VmProcess>>,
}

impl FirecrackerDriver {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Check if Firecracker is available on the system.
    pub async fn is_available() -> bool {
        Command::new("firecracker")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn socket_path(&self, id: &VmId) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", id))
    }

    /// PUT one resource to the VMM API socket.
    ///
    /// Shells out to curl: the HTTP client stack here has no Unix-socket
    /// transport, and the Firecracker API is tiny.
    async fn api_put(
        &self,
        socket_path: &PathBuf,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        let url = format!("http://localhost/{}", endpoint);
        let body_str = serde_json::to_string(body)?;

        debug!(endpoint = %endpoint, "Firecracker API PUT");

        let output = Command::new("curl")
            .args([
                "--unix-socket",
                socket_path.to_str().unwrap_or(""),
                "--fail-with-body",
                "-X",
                "PUT",
                "-H",
                "Content-Type: application/json",
                "-d",
                &body_str,
                &url,
            ])
            .output()
            .await
            .map_err(|e| Error::HypervisorFailure(format!("API call failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(Error::HypervisorFailure(format!(
                "API PUT {} rejected: {} {}",
                endpoint,
                stdout.trim(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HypervisorDriver for FirecrackerDriver {
    async fn create(&self, spec: &VmSpec) -> Result<()> {
        tokio::fs::create_dir_all(&self.socket_dir).await?;
        let socket_path = self.socket_path(&spec.id);
        if socket_path.exists() {
            let _ = tokio::fs::remove_file(&socket_path).await;
        }

        info!(vm_id = %spec.id, "Starting Firecracker VMM");
        let child = Command::new("firecracker")
            .arg("--api-sock")
            .arg(&socket_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::HypervisorFailure(format!("failed to spawn firecracker: {e}")))?;

        // Wait for the API socket to appear.
        for _ in 0..20 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if !socket_path.exists() {
            return Err(Error::HypervisorFailure(
                "VMM API socket never appeared".to_string(),
            ));
        }

        let boot_source = serde_json::json!({
            "kernel_image_path": spec.kernel,
            "boot_args": format!(
                "{} ip={}::{}:255.255.255.252::eth0:off",
                BOOT_ARGS, spec.network.guest_ip, spec.network.gateway_ip
            ),
        });
        self.api_put(&socket_path, "boot-source", &boot_source).await?;

        let machine_config = serde_json::json!({
            "vcpu_count": spec.vcpus,
            "mem_size_mib": spec.memory_mb,
        });
        self.api_put(&socket_path, "machine-config", &machine_config)
            .await?;

        let rootfs = serde_json::json!({
            "drive_id": "rootfs",
            "path_on_host": spec.rootfs,
            "is_root_device": true,
            "is_read_only": false,
        });
        self.api_put(&socket_path, "drives/rootfs", &rootfs).await?;

        let network = serde_json::json!({
            "iface_id": "eth0",
            "guest_mac": spec.network.guest_mac,
            "host_dev_name": spec.network.tap_device,
        });
        self.api_put(&socket_path, "network-interfaces/eth0", &network)
            .await?;

        self.processes
            .lock()
            .await
            .insert(spec.id, VmProcess { child, socket_path });
        Ok(())
    }

    async fn start(&self, id: &VmId) -> Result<()> {
        let socket_path = {
            let processes = self.processes.lock().await;
            processes
                .get(id)
                .map(|p| p.socket_path.clone())
                .ok_or_else(|| Error::HypervisorFailure(format!("unknown VM {id}")))?
        };

        let action = serde_json::json!({ "action_type": "InstanceStart" });
        self.api_put(&socket_path, "actions", &action).await?;
        info!(vm_id = %id, "Firecracker VM started");
        Ok(())
    }

    async fn destroy(&self, id: &VmId) -> Result<()> {
        let Some(mut process) = self.processes.lock().await.remove(id) else {
            return Ok(());
        };

        info!(vm_id = %id, "Destroying Firecracker VM");
        if let Some(pid) = process.child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        tokio::select! {
            _ = process.child.wait() => {}
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                warn!(vm_id = %id, "VMM did not exit on SIGTERM, killing");
                let _ = process.child.kill().await;
            }
        }

        if process.socket_path.exists() {
            let _ = tokio::fs::remove_file(&process.socket_path).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_per_vm() {
        let driver = FirecrackerDriver::new("/tmp/zephyr-vmm");
        let a = VmId::new();
        let b = VmId::new();
        assert_ne!(driver.socket_path(&a), driver.socket_path(&b));
        assert!(driver
            .socket_path(&a)
            .to_string_lossy()
            .ends_with(&format!("{}.sock", a)));
    }

    #[tokio::test]
    async fn test_destroy_unknown_vm_is_noop() {
        let driver = FirecrackerDriver::new("/tmp/zephyr-vmm");
        driver.destroy(&VmId::new()).await.unwrap();
    }
}
