use crate::error::{DriverError, Result};
use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CPU: i32 = 1;
pub const DEFAULT_MEMORY: u32 = 1024;
pub const DEFAULT_DISK_SIZE: u64 = 20000;
pub const DEFAULT_HOST_ONLY_CIDR: &str = "192.168.99.1/24";
pub const DEFAULT_HOST_ONLY_NIC_TYPE: &str = "82540EM";
pub const DEFAULT_HOST_ONLY_PROMISC_MODE: &str = "deny";
pub const MAX_CPUS: u32 = 32;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Directory holding one folder per machine and the seed image cache
    pub store_path: PathBuf,

    /// Path to the VBoxManage binary, looked up in PATH when not set
    pub vboxmanage: Option<PathBuf>,

    /// Machine configuration applied on create
    pub node: NodeConfig,

    /// Bounds for every polling loop
    pub wait: WaitPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("machines"),
            vboxmanage: None,
            node: NodeConfig::default(),
            wait: WaitPolicy::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional YAML file, then `NODE_*` env vars
    ///
    /// Nested keys use a double underscore, e.g. `NODE_NODE__DISK_SIZE=40000`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, std::env::vars())
    }

    /// [Settings::load] with the environment passed in
    pub fn load_with_env(
        path: Option<&Path>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(File::from(p));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env_overrides(vars))),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DriverError::Config(e.to_string()))?;
        settings.node.validate()?;
        Ok(settings)
    }
}

const ENV_PREFIX: &str = "NODE";

/// Keep the `NODE_` variables, spelling each key segment in kebab-case
/// (`NODE_WAIT__SSH_ATTEMPTS` becomes `NODE_WAIT__SSH-ATTEMPTS`)
fn env_overrides(vars: impl IntoIterator<Item = (String, String)>) -> Map<String, String> {
    let prefix = format!("{}_", ENV_PREFIX);
    vars.into_iter()
        .filter_map(|(k, v)| {
            let key = k.strip_prefix(&prefix)?;
            let key = key
                .split("__")
                .map(|seg| seg.replace('_', "-"))
                .collect::<Vec<_>>()
                .join("__");
            Some((format!("{}{}", prefix, key), v))
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NodeConfig {
    /// Memory in MB
    pub memory: u32,
    /// Number of CPUs, values below 1 use every host core
    pub cpu: i32,
    /// Disk size in MB
    pub disk_size: u64,
    /// URL (or local path) of the seed ISO
    pub seed_url: Option<String>,
    /// Name of an existing VM whose disk and settings are imported
    pub import_vm: Option<String>,
    /// Private key copied into the machine dir when importing a VM
    pub import_ssh_key: Option<PathBuf>,
    pub host_only_cidr: String,
    pub host_only_nic_type: String,
    pub host_only_promisc_mode: String,
    /// Disable the host folder share
    pub no_share: bool,
    /// Override the host folder share, otherwise an OS default is used
    pub share: Option<ShareConfig>,
    pub dns_proxy: bool,
    pub host_dns_resolver: bool,
    /// Skip the hardware virtualization check
    pub no_vtx_check: bool,
    pub ssh_user: String,
    /// Preferred host port for the SSH forward, 0 lets the OS pick
    pub ssh_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY,
            cpu: DEFAULT_CPU,
            disk_size: DEFAULT_DISK_SIZE,
            seed_url: None,
            import_vm: None,
            import_ssh_key: None,
            host_only_cidr: DEFAULT_HOST_ONLY_CIDR.to_string(),
            host_only_nic_type: DEFAULT_HOST_ONLY_NIC_TYPE.to_string(),
            host_only_promisc_mode: DEFAULT_HOST_ONLY_PROMISC_MODE.to_string(),
            no_share: false,
            share: None,
            dns_proxy: false,
            host_dns_resolver: false,
            no_vtx_check: false,
            ssh_user: "docker".to_string(),
            ssh_port: 0,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memory == 0 {
            return Err(DriverError::Config("memory must be positive".into()));
        }
        if self.disk_size == 0 {
            return Err(DriverError::Config("disk-size must be positive".into()));
        }
        Ok(())
    }

    /// CPU count passed to `modifyvm`
    ///
    /// Values below 1 resolve to `host_cpus`; the result is capped at [MAX_CPUS].
    /// TODO: reject 0 explicitly once callers stop using it to mean "all cores"
    pub fn normalized_cpus(&self, host_cpus: usize) -> u32 {
        normalize_cpus(self.cpu, host_cpus)
    }

    /// The folder shared with the guest, if any
    pub fn share(&self) -> Option<ShareConfig> {
        if self.no_share {
            return None;
        }
        self.share.clone().or_else(ShareConfig::host_default)
    }
}

/// See [NodeConfig::normalized_cpus]
pub fn normalize_cpus(cpu: i32, host_cpus: usize) -> u32 {
    let cpus = if cpu < 1 { host_cpus as u32 } else { cpu as u32 };
    cpus.clamp(1, MAX_CPUS)
}

/// Number of cores on this host
pub fn host_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ShareConfig {
    pub name: String,
    pub host_path: PathBuf,
}

impl ShareConfig {
    pub fn host_default() -> Option<Self> {
        let (name, path) = if cfg!(target_os = "windows") {
            ("c/Users", "C:\\Users")
        } else if cfg!(target_os = "macos") {
            ("Users", "/Users")
        } else if cfg!(target_os = "linux") {
            ("hosthome", "/home")
        } else {
            return None;
        };
        Some(Self {
            name: name.to_string(),
            host_path: PathBuf::from(path),
        })
    }

    /// VirtualBox misbehaves with share names starting with `/`
    pub fn vbox_name(&self) -> String {
        if self.name.is_empty() {
            self.host_path
                .to_string_lossy()
                .trim_start_matches('/')
                .to_string()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WaitPolicy {
    pub ssh_attempts: u32,
    pub ssh_interval_ms: u64,
    pub ip_attempts: u32,
    pub ip_interval_ms: u64,
    pub stop_attempts: u32,
    pub stop_interval_ms: u64,
    /// Pause between stopping a VM and unregistering it
    pub lock_release_delay_ms: u64,
    pub port_attempts: u32,
    /// Backoff step between port allocation attempts, multiplied by the attempt number
    pub port_backoff_ms: u64,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            ssh_attempts: 60,
            ssh_interval_ms: 3000,
            ip_attempts: 5,
            ip_interval_ms: 4000,
            stop_attempts: 120,
            stop_interval_ms: 1000,
            lock_release_delay_ms: 1000,
            port_attempts: 10,
            port_backoff_ms: 10,
        }
    }
}

impl WaitPolicy {
    pub fn ssh_interval(&self) -> Duration {
        Duration::from_millis(self.ssh_interval_ms)
    }

    pub fn ip_interval(&self) -> Duration {
        Duration::from_millis(self.ip_interval_ms)
    }

    pub fn stop_interval(&self) -> Duration {
        Duration::from_millis(self.stop_interval_ms)
    }

    pub fn lock_release_delay(&self) -> Duration {
        Duration::from_millis(self.lock_release_delay_ms)
    }

    pub fn port_backoff(&self) -> Duration {
        Duration::from_millis(self.port_backoff_ms)
    }
}
