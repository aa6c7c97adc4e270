use crate::error::{DriverError, Result};
use crate::vbox::VBoxManager;
use log::debug;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Find a free TCP port on 127.0.0.1, trying `preferred` first and falling
/// back to a port picked by the OS.
///
/// The test listener is dropped before returning, so the port can be taken
/// by someone else before the hypervisor binds it. Concurrent callers are not
/// serialized.
pub async fn get_available_tcp_port(preferred: u16, attempts: u32, backoff: Duration) -> Result<u16> {
    find_port(preferred, attempts, backoff, |port| async move {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        Ok::<_, std::io::Error>(listener.local_addr()?.port())
    })
    .await
}

async fn find_port<F, Fut>(preferred: u16, attempts: u32, backoff: Duration, mut bind: F) -> Result<u16>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = std::io::Result<u16>>,
{
    let mut port = preferred;
    for attempt in 1..=attempts {
        match bind(port).await {
            Ok(bound) if bound != 0 => return Ok(bound),
            Ok(_) => debug!("Port {} bound to port 0", port),
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
        // throw away the hint before trying again
        port = 0;
        tokio::time::sleep(backoff * attempt).await;
    }
    Err(DriverError::PortAllocationFailed(attempts))
}

/// Install a NAT forwarding rule `name,protocol,127.0.0.1,<host port>,,guest_port`
/// on NAT interface `iface`, replacing any rule with the same name.
///
/// Returns the host port actually used.
#[allow(clippy::too_many_arguments)]
pub async fn set_port_forwarding(
    vbox: &dyn VBoxManager,
    machine: &str,
    iface: u8,
    name: &str,
    protocol: &str,
    guest_port: u16,
    desired_host_port: u16,
    attempts: u32,
    backoff: Duration,
) -> Result<u16> {
    let host_port = get_available_tcp_port(desired_host_port, attempts, backoff).await?;
    if desired_host_port != 0 && desired_host_port != host_port {
        debug!(
            "NAT forwarding host port for guest port {} ({}) changed from {} to {}",
            guest_port, name, desired_host_port, host_port
        );
    }
    let flag = format!("--natpf{}", iface);
    // the rule may not exist yet
    if let Err(e) = vbox.vbm(&["modifyvm", machine, &flag, "delete", name]).await {
        debug!("No forwarding rule {} to delete: {}", name, e);
    }
    let rule = format!(
        "{},{},127.0.0.1,{},,{}",
        name, protocol, host_port, guest_port
    );
    vbox.vbm(&["modifyvm", machine, &flag, &rule]).await?;
    Ok(host_port)
}
