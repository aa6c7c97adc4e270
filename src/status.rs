use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// Machine state as reported by the hypervisor, never cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    NotExist,
    Stopped,
    Running,
    Paused,
    Saved,
    Error,
    Unknown,
}

impl VmState {
    /// Map a `VMState` token to a state, unknown tokens are not an error
    pub fn from_token(token: &str) -> Self {
        match token {
            "running" => VmState::Running,
            "paused" => VmState::Paused,
            "saved" => VmState::Saved,
            "poweroff" | "aborted" => VmState::Stopped,
            _ => VmState::Unknown,
        }
    }

    /// Extract the state from `showvminfo --machinereadable` output
    pub fn from_machine_readable(output: &str) -> Self {
        parse_machine_readable(output)
            .get("VMState")
            .map(|s| VmState::from_token(s))
            .unwrap_or(VmState::Unknown)
    }
}

impl Display for VmState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::NotExist => "not-exist",
            VmState::Stopped => "stopped",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Saved => "saved",
            VmState::Error => "error",
            VmState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Parse `showvminfo --machinereadable` output.
///
/// One pair per line, `key=value`, where either side may be wrapped in double
/// quotes (`"SATA-1-0"="/path/disk.vmdk"`, `cpus=2`). Lines without `=` are skipped.
pub fn parse_machine_readable(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (k, v) = split_pair(line)?;
            Some((unquote(k).to_string(), unquote(v).to_string()))
        })
        .collect()
}

fn split_pair(line: &str) -> Option<(&str, &str)> {
    // quoted keys may contain '='
    if let Some(rest) = line.strip_prefix('"') {
        let end = rest.find("\"=")?;
        return Some((&line[..end + 2], &rest[end + 2..]));
    }
    line.split_once('=')
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// First IPv4 address in `ip addr show` output
///
/// Matches lines of the form `inet 192.168.99.100/24 brd ... scope global eth1`.
pub fn parse_inet_address(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != "inet" {
            return None;
        }
        let (ip, _prefix) = parts.next()?.split_once('/')?;
        ip.parse().ok()
    })
}

/// Host port of the NAT forwarding rule `rule` in `showvminfo` output
///
/// Rules are listed as `Forwarding(0)="ssh,tcp,127.0.0.1,50022,,22"`.
pub fn forwarded_host_port(output: &str, rule: &str) -> Option<u16> {
    parse_machine_readable(output)
        .into_iter()
        .filter(|(k, _)| k.starts_with("Forwarding("))
        .find_map(|(_, v)| {
            let fields: Vec<&str> = v.split(',').collect();
            match fields.as_slice() {
                [name, _proto, _host_ip, host_port, _guest_ip, _guest_port] if *name == rule => {
                    host_port.parse().ok()
                }
                _ => None,
            }
        })
}
