use std::net::Ipv4Addr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors raised while driving a node through its lifecycle
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("VBoxManage not found, make sure VirtualBox is installed and VBoxManage is in the path")]
    ToolUnavailable,

    #[error("unsupported VirtualBox version {0:?}, version 5 or later is required")]
    UnsupportedVersion(String),

    #[error("this computer doesn't have VT-X/AMD-v enabled, enabling it in the BIOS is mandatory")]
    VirtualizationRequired,

    #[error("host-only cidr must be specified with a host address, not a network address")]
    NetworkIsNetworkAddress,

    #[error("invalid host-only cidr {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("unable to generate random IP in the subnet of {0}")]
    RandomIpGenerationFailed(Ipv4Addr),

    #[error("unable to allocate tcp port after {0} attempts")]
    PortAllocationFailed(u32),

    #[error("machine {0:?} does not exist")]
    MachineNotFound(String),

    #[error("host is not running")]
    HostNotRunning,

    #[error("ssh did not become available after {0} attempts")]
    SshWaitTimeout(u32),

    #[error("no host-only IP address was observed after {0} attempts")]
    IpWaitTimeout(u32),

    #[error("machine did not stop after {0} attempts")]
    StopTimeout(u32),

    #[error("no IP address found in guest output: {0}")]
    NoIpAddress(String),

    #[error("VBoxManage {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected VBoxManage output: {0}")]
    UnexpectedOutput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("seed image: {0}")]
    SeedImage(String),

    #[error("ssh: {0}")]
    Ssh(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// True when the hypervisor reported that the machine is not registered
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::MachineNotFound(_))
    }
}

impl From<ssh2::Error> for DriverError {
    fn from(e: ssh2::Error) -> Self {
        DriverError::Ssh(e.to_string())
    }
}

impl From<ssh_key::Error> for DriverError {
    fn from(e: ssh_key::Error) -> Self {
        DriverError::Ssh(e.to_string())
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        DriverError::SeedImage(e.to_string())
    }
}
