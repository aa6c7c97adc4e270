use crate::error::{DriverError, Result};
use crate::vbox::VBoxManager;
use ipnetwork::Ipv4Network;
use log::{debug, info};
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;

const DHCP_PICK_ATTEMPTS: u32 = 5;
/// DHCP server address is picked from the lowest addresses of the subnet
const DHCP_PICK_RANGE: u8 = 25;
const LEASE_LOWER_OCTET: u8 = 100;
const LEASE_UPPER_OCTET: u8 = 254;

/// A host-only interface as listed by `VBoxManage list hostonlyifs`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostOnlyNetwork {
    pub name: String,
    pub guid: String,
    pub dhcp: bool,
    pub ipv4: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub hw_addr: String,
    pub medium: String,
    pub status: String,
    pub network_name: String,
}

impl HostOnlyNetwork {
    /// Name of the DHCP network VirtualBox associates with this interface
    pub fn dhcp_network_name(&self) -> String {
        format!("HostInterfaceNetworking-{}", self.name)
    }

    fn matches(&self, host_ip: Ipv4Addr, netmask: Ipv4Addr) -> bool {
        self.ipv4 == Some(host_ip) && self.netmask == Some(netmask)
    }
}

/// A DHCP server as listed by `VBoxManage list dhcpservers`
#[derive(Debug, Clone, PartialEq)]
pub struct DhcpServer {
    pub network_name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub lower_ip: Ipv4Addr,
    pub upper_ip: Ipv4Addr,
    pub enabled: bool,
}

/// Parse a host-only CIDR such as `192.168.99.1/24`
///
/// The address part must be a usable host address, not the network address.
pub fn parse_and_validate_cidr(cidr: &str) -> Result<(Ipv4Addr, Ipv4Network)> {
    // a bare address would parse as a /32
    if !cidr.contains('/') {
        return Err(DriverError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: "missing prefix length".to_string(),
        });
    }
    let parsed: Ipv4Network = cidr.trim().parse().map_err(|e| DriverError::InvalidCidr {
        cidr: cidr.to_string(),
        reason: format!("{}", e),
    })?;
    let host_ip = parsed.ip();
    let network = Ipv4Network::new(parsed.network(), parsed.prefix()).map_err(|e| {
        DriverError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: format!("{}", e),
        }
    })?;
    if host_ip == network.network() {
        return Err(DriverError::NetworkIsNetworkAddress);
    }
    Ok((host_ip, network))
}

/// Pick the DHCP server address, a pseudo-random low address in the subnet
/// of `host_ip` which is not `host_ip` itself.
///
/// `next_octet` yields candidate last octets, it is asked at most 5 times.
pub fn pick_random_dhcp_address<F>(host_ip: Ipv4Addr, mut next_octet: F) -> Result<Ipv4Addr>
where
    F: FnMut() -> u8,
{
    let [a, b, c, d] = host_ip.octets();
    for _ in 0..DHCP_PICK_ATTEMPTS {
        let n = next_octet();
        if n != d {
            return Ok(Ipv4Addr::new(a, b, c, n));
        }
    }
    Err(DriverError::RandomIpGenerationFailed(host_ip))
}

/// Random source for [pick_random_dhcp_address]
pub fn random_low_octet() -> u8 {
    rand::rng().random_range(0..DHCP_PICK_RANGE)
}

/// DHCP lease range `.100`-`.254` of the network
pub fn dhcp_lease_range(network: &Ipv4Network) -> (Ipv4Addr, Ipv4Addr) {
    let [a, b, c, _] = network.network().octets();
    (
        Ipv4Addr::new(a, b, c, LEASE_LOWER_OCTET),
        Ipv4Addr::new(a, b, c, LEASE_UPPER_OCTET),
    )
}

/// Split colon separated `Key: value` blocks, blocks are separated by blank lines
fn parse_colon_blocks(output: &str) -> Vec<HashMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current = HashMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            current.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn parse_ip(block: &HashMap<String, String>, key: &str) -> Option<Ipv4Addr> {
    block.get(key).and_then(|v| v.parse().ok())
}

fn field(block: &mut HashMap<String, String>, key: &str) -> String {
    block.remove(key).unwrap_or_default()
}

pub fn parse_host_only_networks(output: &str) -> Vec<HostOnlyNetwork> {
    parse_colon_blocks(output)
        .into_iter()
        .filter(|b| b.contains_key("Name"))
        .map(|mut b| HostOnlyNetwork {
            ipv4: parse_ip(&b, "IPAddress"),
            netmask: parse_ip(&b, "NetworkMask"),
            dhcp: b.get("DHCP").map(|v| v != "Disabled").unwrap_or(false),
            name: field(&mut b, "Name"),
            guid: field(&mut b, "GUID"),
            hw_addr: field(&mut b, "HardwareAddress"),
            medium: field(&mut b, "MediumType"),
            status: field(&mut b, "Status"),
            network_name: field(&mut b, "VBoxNetworkName"),
        })
        .collect()
}

pub fn parse_dhcp_servers(output: &str) -> Vec<DhcpServer> {
    parse_colon_blocks(output)
        .into_iter()
        .filter_map(|b| {
            Some(DhcpServer {
                network_name: b.get("NetworkName")?.clone(),
                ip: parse_ip(&b, "IP")?,
                netmask: parse_ip(&b, "NetworkMask")?,
                lower_ip: parse_ip(&b, "lowerIPAddress")?,
                upper_ip: parse_ip(&b, "upperIPAddress")?,
                enabled: b.get("Enabled").map(|v| v == "Yes").unwrap_or(false),
            })
        })
        .collect()
}

pub async fn list_host_only_networks(vbox: &dyn VBoxManager) -> Result<Vec<HostOnlyNetwork>> {
    let out = vbox.vbm_out(&["list", "hostonlyifs"]).await?;
    Ok(parse_host_only_networks(&out))
}

pub async fn list_dhcp_servers(vbox: &dyn VBoxManager) -> Result<Vec<DhcpServer>> {
    let out = vbox.vbm_out(&["list", "dhcpservers"]).await?;
    Ok(parse_dhcp_servers(&out))
}

async fn create_host_only_interface(vbox: &dyn VBoxManager) -> Result<HostOnlyNetwork> {
    let out = vbox.vbm_out(&["hostonlyif", "create"]).await?;
    // Interface 'vboxnet0' was successfully created
    let name = out
        .split_once("Interface '")
        .and_then(|(_, rest)| rest.split_once("' was successfully created"))
        .map(|(name, _)| name.to_string())
        .ok_or_else(|| DriverError::UnexpectedOutput(out.trim().to_string()))?;
    Ok(HostOnlyNetwork {
        name,
        ..Default::default()
    })
}

async fn configure_dhcp_server(
    vbox: &dyn VBoxManager,
    network_name: &str,
    server: &DhcpServer,
) -> Result<()> {
    // some platforms create a default DHCP server with the interface, modify it in that case
    let existing = list_dhcp_servers(vbox).await?;
    let command = if existing.iter().any(|d| d.network_name == network_name) {
        "modify"
    } else {
        "add"
    };
    let ip = server.ip.to_string();
    let mask = server.netmask.to_string();
    let lower = server.lower_ip.to_string();
    let upper = server.upper_ip.to_string();
    vbox.vbm(&[
        "dhcpserver",
        command,
        "--netname",
        network_name,
        "--ip",
        &ip,
        "--netmask",
        &mask,
        "--lowerip",
        &lower,
        "--upperip",
        &upper,
        if server.enabled { "--enable" } else { "--disable" },
    ])
    .await
}

/// Find the host-only network for `host_ip`/`netmask`, creating the interface
/// and its DHCP server when none matches.
///
/// Safe to call repeatedly, an existing network is reused as is.
pub async fn get_or_create_host_only_network(
    vbox: &dyn VBoxManager,
    host_ip: Ipv4Addr,
    netmask: Ipv4Addr,
    dhcp_ip: Ipv4Addr,
    lower_ip: Ipv4Addr,
    upper_ip: Ipv4Addr,
) -> Result<HostOnlyNetwork> {
    let nets = list_host_only_networks(vbox).await?;
    if let Some(n) = nets.into_iter().find(|n| n.matches(host_ip, netmask)) {
        debug!("Using existing host-only network {}", n.name);
        return Ok(n);
    }

    let mut net = create_host_only_interface(vbox).await?;
    info!("Created host-only network {} for {}", net.name, host_ip);

    let ip = host_ip.to_string();
    let mask = netmask.to_string();
    vbox.vbm(&[
        "hostonlyif",
        "ipconfig",
        &net.name,
        "--ip",
        &ip,
        "--netmask",
        &mask,
    ])
    .await?;
    net.ipv4 = Some(host_ip);
    net.netmask = Some(netmask);

    let server = DhcpServer {
        network_name: net.dhcp_network_name(),
        ip: dhcp_ip,
        netmask,
        lower_ip,
        upper_ip,
        enabled: true,
    };
    configure_dhcp_server(vbox, &server.network_name, &server).await?;
    net.dhcp = true;
    Ok(net)
}
