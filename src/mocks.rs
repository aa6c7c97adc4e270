#![allow(unused)]
use crate::error::{DriverError, Result};
use crate::network::{DhcpServer, HostOnlyNetwork};
use crate::ssh_client::GuestShell;
use crate::vbox::{classify_failure, VBoxManager};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

pub const MOCK_VBOX_VERSION: &str = "7.0.14r161095";

/// What `convertfromraw` received for one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertedImage {
    /// Size given on the command line
    pub declared: u64,
    /// Bytes read from stdin
    pub received: u64,
    /// Non-zero bytes before the first zero byte
    pub leading: u64,
}

#[derive(Debug, Clone)]
pub struct MockVm {
    pub state: String,
    pub cpus: u32,
    pub memory: u32,
    pub basefolder: Option<PathBuf>,
    pub disks: BTreeMap<u8, String>,
    pub disk_uuid: String,
    pub forwarding: HashMap<String, String>,
    pub host_only_adapter: Option<String>,
    pub shared_folders: Vec<String>,
    /// Polls left reporting `running` after an ACPI shutdown request
    pending_stop: Option<u32>,
}

impl MockVm {
    fn new(state: &str) -> Self {
        Self {
            state: state.to_string(),
            cpus: 1,
            memory: 1024,
            basefolder: None,
            disks: BTreeMap::new(),
            disk_uuid: String::new(),
            forwarding: HashMap::new(),
            host_only_adapter: None,
            shared_folders: Vec::new(),
            pending_stop: None,
        }
    }
}

#[derive(Debug)]
struct MockVBoxState {
    version: String,
    vms: HashMap<String, MockVm>,
    host_only: Vec<HostOnlyNetwork>,
    dhcp: Vec<DhcpServer>,
    auto_dhcp: bool,
    converted: HashMap<String, ConvertedImage>,
    fail_on: HashSet<String>,
    calls: Vec<Vec<String>>,
    /// `None` means the guest ignores ACPI shutdown requests
    acpi_delay: Option<u32>,
    vm_log: String,
    next_uuid: u32,
}

impl Default for MockVBoxState {
    fn default() -> Self {
        Self {
            version: MOCK_VBOX_VERSION.to_string(),
            vms: HashMap::new(),
            host_only: Vec::new(),
            dhcp: Vec::new(),
            auto_dhcp: false,
            converted: HashMap::new(),
            fail_on: HashSet::new(),
            calls: Vec::new(),
            acpi_delay: Some(0),
            vm_log: "00:00:00.000000 VirtualBox VM starting\n00:00:00.100000 HM: HMR3Init: VT-x w/ nested paging\n".to_string(),
            next_uuid: 1,
        }
    }
}

/// In-memory VBoxManage recording every call
#[derive(Debug, Clone, Default)]
pub struct MockVBox {
    state: Arc<Mutex<MockVBoxState>>,
}

fn not_found(args: &[&str], name: &str) -> DriverError {
    classify_failure(
        args,
        &format!(
            "VBoxManage: error: Could not find a registered machine named '{}'\nVBoxManage: error: Details: code VBOX_E_OBJECT_NOT_FOUND (0x80bb0001)",
            name
        ),
    )
}

fn failed(args: &[&str], msg: &str) -> DriverError {
    classify_failure(args, &format!("VBoxManage: error: {}", msg))
}

/// Value following `flag` in `args`
fn flag_value<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == flag)
        .and_then(|i| args.get(i + 1))
        .copied()
}

fn parse_ip(args: &[&str], flag: &str) -> Ipv4Addr {
    flag_value(args, flag)
        .and_then(|v| v.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

impl MockVBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a powered off VM without a base folder
    pub async fn add_vm(&self, name: &str) {
        let mut s = self.state.lock().await;
        s.vms.insert(name.to_string(), MockVm::new("poweroff"));
    }

    /// Register a template VM with a disk on SATA port 1
    pub async fn add_template(&self, name: &str, cpus: u32, memory: u32, disk: &str) {
        let mut s = self.state.lock().await;
        let uuid = format!("00000000-0000-0000-0000-{:012}", s.next_uuid);
        s.next_uuid += 1;
        let mut vm = MockVm::new("running");
        vm.cpus = cpus;
        vm.memory = memory;
        vm.disks.insert(1, disk.to_string());
        vm.disk_uuid = uuid;
        s.vms.insert(name.to_string(), vm);
    }

    pub async fn set_state(&self, name: &str, state: &str) {
        let mut s = self.state.lock().await;
        if let Some(vm) = s.vms.get_mut(name) {
            vm.state = state.to_string();
            vm.pending_stop = None;
        }
    }

    pub async fn set_version(&self, version: &str) {
        self.state.lock().await.version = version.to_string();
    }

    /// Polls reporting `running` after `acpipowerbutton`, `None` never stops
    pub async fn set_acpi_delay(&self, polls: Option<u32>) {
        self.state.lock().await.acpi_delay = polls;
    }

    /// Content of `Logs/VBox.log` written by `startvm`
    pub async fn set_vm_log(&self, content: &str) {
        self.state.lock().await.vm_log = content.to_string();
    }

    /// Create a default DHCP server together with each host-only interface
    pub async fn set_auto_dhcp(&self, enabled: bool) {
        self.state.lock().await.auto_dhcp = enabled;
    }

    /// Fail every invocation of subcommand `cmd`
    pub async fn fail_on(&self, cmd: &str) {
        self.state.lock().await.fail_on.insert(cmd.to_string());
    }

    pub async fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls starting with `prefix`
    pub async fn count_calls(&self, prefix: &[&str]) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.len() >= prefix.len() && c.iter().zip(prefix).all(|(a, b)| a == b))
            .count()
    }

    pub async fn vm(&self, name: &str) -> Option<MockVm> {
        self.state.lock().await.vms.get(name).cloned()
    }

    pub async fn dhcp_server(&self, network_name: &str) -> Option<DhcpServer> {
        self.state
            .lock()
            .await
            .dhcp
            .iter()
            .find(|d| d.network_name == network_name)
            .cloned()
    }

    pub async fn host_only_networks(&self) -> Vec<HostOnlyNetwork> {
        self.state.lock().await.host_only.clone()
    }

    pub async fn forwarding(&self, vm: &str, rule: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .vms
            .get(vm)
            .and_then(|v| v.forwarding.get(rule).cloned())
    }

    pub async fn converted(&self, dest: &str) -> Option<ConvertedImage> {
        self.state.lock().await.converted.get(dest).copied()
    }
}

impl MockVBoxState {
    fn vm_mut(&mut self, args: &[&str], name: &str) -> Result<&mut MockVm> {
        self.vms.get_mut(name).ok_or_else(|| not_found(args, name))
    }

    fn exec(&mut self, args: &[&str]) -> Result<String> {
        let Some(cmd) = args.first() else {
            return Err(failed(args, "no command"));
        };
        if self.fail_on.contains(*cmd) {
            return Err(failed(args, "scripted failure"));
        }
        let arg = |i: usize| args.get(i).copied().unwrap_or_default();
        match *cmd {
            "--version" => Ok(format!("{}\n", self.version)),
            "createvm" => {
                let name = flag_value(args, "--name").unwrap_or_default();
                if self.vms.contains_key(name) {
                    return Err(failed(args, &format!("Machine '{}' already exists", name)));
                }
                let mut vm = MockVm::new("poweroff");
                vm.basefolder = flag_value(args, "--basefolder").map(PathBuf::from);
                self.vms.insert(name.to_string(), vm);
                Ok(format!(
                    "Virtual machine '{}' is created and registered.\n",
                    name
                ))
            }
            "modifyvm" => {
                let vm = self.vm_mut(args, arg(1))?;
                let mut i = 2;
                while i < args.len() {
                    let flag = args[i];
                    let value = arg(i + 1);
                    match flag {
                        "--cpus" => vm.cpus = value.parse().unwrap_or(vm.cpus),
                        "--memory" => vm.memory = value.parse().unwrap_or(vm.memory),
                        "--hostonlyadapter2" => vm.host_only_adapter = Some(value.to_string()),
                        f if f.starts_with("--natpf") => {
                            if value == "delete" {
                                let rule = arg(i + 2);
                                if vm.forwarding.remove(rule).is_none() {
                                    return Err(failed(
                                        args,
                                        &format!("Port forwarding rule '{}' not found", rule),
                                    ));
                                }
                                i += 1;
                            } else {
                                let name = value.split(',').next().unwrap_or_default();
                                vm.forwarding.insert(name.to_string(), value.to_string());
                            }
                        }
                        _ => {}
                    }
                    i += 2;
                }
                Ok(String::new())
            }
            "storagectl" => {
                self.vm_mut(args, arg(1))?;
                Ok(String::new())
            }
            "storageattach" => {
                let vm = self.vm_mut(args, arg(1))?;
                let port: u8 = flag_value(args, "--port")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_default();
                let medium = flag_value(args, "--medium").unwrap_or_default();
                vm.disks.insert(port, medium.to_string());
                Ok(String::new())
            }
            "guestproperty" | "sharedfolder" => {
                let vm = self.vm_mut(args, arg(2))?;
                if *cmd == "sharedfolder" {
                    vm.shared_folders
                        .push(flag_value(args, "--name").unwrap_or_default().to_string());
                }
                Ok(String::new())
            }
            "setextradata" => {
                self.vm_mut(args, arg(1))?;
                Ok(String::new())
            }
            "startvm" => {
                let name = arg(1);
                let log = self.vm_log.clone();
                let vm = self.vm_mut(args, name)?;
                match vm.state.as_str() {
                    "poweroff" | "saved" | "aborted" => {}
                    _ => {
                        return Err(failed(
                            args,
                            &format!("The machine '{}' is already locked for a session", name),
                        ))
                    }
                }
                vm.state = "running".to_string();
                if let Some(base) = &vm.basefolder {
                    let dir = base.join(name).join("Logs");
                    std::fs::create_dir_all(&dir)?;
                    std::fs::write(dir.join("VBox.log"), log)?;
                }
                Ok(format!(
                    "Waiting for VM \"{}\" to power on...\nVM \"{}\" has been successfully started.\n",
                    name, name
                ))
            }
            "controlvm" => {
                let delay = self.acpi_delay;
                let vm = self.vm_mut(args, arg(1))?;
                let current = vm.state.clone();
                match (arg(2), current.as_str()) {
                    ("resume", "paused") => vm.state = "running".to_string(),
                    ("acpipowerbutton", "running") => vm.pending_stop = Some(delay.unwrap_or(u32::MAX)),
                    ("reset", "running") => {}
                    ("poweroff", "running" | "paused") => {
                        vm.state = "poweroff".to_string();
                        vm.pending_stop = None;
                    }
                    (action, state) => {
                        return Err(failed(
                            args,
                            &format!("cannot {} a machine in state {}", action, state),
                        ))
                    }
                }
                Ok(String::new())
            }
            "showvminfo" => {
                let infinite = self.acpi_delay.is_none();
                let name = arg(1);
                let vm = self.vm_mut(args, name)?;
                match vm.pending_stop {
                    Some(0) => {
                        vm.state = "poweroff".to_string();
                        vm.pending_stop = None;
                    }
                    Some(n) if !infinite => vm.pending_stop = Some(n - 1),
                    _ => {}
                }
                let mut out = format!(
                    "name=\"{}\"\nostype=\"Linux26_64\"\nmemory={}\ncpus={}\nVMState=\"{}\"\n",
                    name, vm.memory, vm.cpus, vm.state
                );
                let mut rules: Vec<&String> = vm.forwarding.values().collect();
                rules.sort();
                for (i, rule) in rules.into_iter().enumerate() {
                    out.push_str(&format!("Forwarding({})=\"{}\"\n", i, rule));
                }
                for (port, medium) in &vm.disks {
                    out.push_str(&format!("\"SATA-{}-0\"=\"{}\"\n", port, medium));
                    if *port == 1 && !vm.disk_uuid.is_empty() {
                        out.push_str(&format!("\"SATA-ImageUUID-1-0\"=\"{}\"\n", vm.disk_uuid));
                    }
                }
                Ok(out)
            }
            "unregistervm" => {
                let name = args
                    .iter()
                    .skip(1)
                    .find(|a| !a.starts_with("--"))
                    .copied()
                    .unwrap_or_default();
                self.vm_mut(args, name)?;
                self.vms.remove(name);
                Ok(String::new())
            }
            "list" => match arg(1) {
                "hostonlyifs" => Ok(self.list_host_only()),
                "dhcpservers" => Ok(self.list_dhcp()),
                other => Err(failed(args, &format!("unknown list {}", other))),
            },
            "hostonlyif" => match arg(1) {
                "create" => {
                    let idx = self.host_only.len();
                    let name = format!("vboxnet{}", idx);
                    self.host_only.push(HostOnlyNetwork {
                        name: name.clone(),
                        guid: format!("786f6276-656e-4074-8000-0a00270000{:02}", idx),
                        hw_addr: "0a:00:27:00:00:00".to_string(),
                        medium: "Ethernet".to_string(),
                        status: "Up".to_string(),
                        network_name: format!("HostInterfaceNetworking-{}", name),
                        ..Default::default()
                    });
                    if self.auto_dhcp {
                        self.dhcp.push(DhcpServer {
                            network_name: format!("HostInterfaceNetworking-{}", name),
                            ip: Ipv4Addr::new(192, 168, 56, 100),
                            netmask: Ipv4Addr::new(255, 255, 255, 0),
                            lower_ip: Ipv4Addr::new(192, 168, 56, 101),
                            upper_ip: Ipv4Addr::new(192, 168, 56, 254),
                            enabled: true,
                        });
                    }
                    Ok(format!(
                        "0%...10%...100%\nInterface '{}' was successfully created\n",
                        name
                    ))
                }
                "ipconfig" => {
                    let name = arg(2);
                    let ip = parse_ip(args, "--ip");
                    let mask = parse_ip(args, "--netmask");
                    let net = self
                        .host_only
                        .iter_mut()
                        .find(|n| n.name == name)
                        .ok_or_else(|| failed(args, &format!("no host-only interface {}", name)))?;
                    net.ipv4 = Some(ip);
                    net.netmask = Some(mask);
                    Ok(String::new())
                }
                other => Err(failed(args, &format!("unknown hostonlyif {}", other))),
            },
            "dhcpserver" => {
                let netname = flag_value(args, "--netname").unwrap_or_default();
                let server = DhcpServer {
                    network_name: netname.to_string(),
                    ip: parse_ip(args, "--ip"),
                    netmask: parse_ip(args, "--netmask"),
                    lower_ip: parse_ip(args, "--lowerip"),
                    upper_ip: parse_ip(args, "--upperip"),
                    enabled: args.contains(&"--enable"),
                };
                let existing = self.dhcp.iter().position(|d| d.network_name == netname);
                match (arg(1), existing) {
                    ("add", None) => self.dhcp.push(server),
                    ("modify", Some(i)) => self.dhcp[i] = server,
                    ("add", Some(_)) => {
                        return Err(failed(args, "DHCP server already exists"));
                    }
                    _ => return Err(failed(args, "DHCP server does not exist")),
                }
                if let Some(net) = self
                    .host_only
                    .iter_mut()
                    .find(|n| n.dhcp_network_name() == netname)
                {
                    net.dhcp = true;
                }
                Ok(String::new())
            }
            "clonehd" => Ok(format!(
                "0%...10%...100%\nClone medium created in format 'VMDK'. UUID: 00000000-0000-0000-0000-{:012}\n",
                self.next_uuid
            )),
            _ => Err(failed(args, &format!("unknown command {}", cmd))),
        }
    }

    fn list_host_only(&self) -> String {
        let mut out = String::new();
        for n in &self.host_only {
            out.push_str(&format!(
                "Name:            {}\nGUID:            {}\nDHCP:            {}\nIPAddress:       {}\nNetworkMask:     {}\nIPV6Address:\nIPV6NetworkMaskPrefixLength: 0\nHardwareAddress: {}\nMediumType:      {}\nWireless:        No\nStatus:          {}\nVBoxNetworkName: {}\n\n",
                n.name,
                n.guid,
                if n.dhcp { "Enabled" } else { "Disabled" },
                n.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED),
                n.netmask.unwrap_or(Ipv4Addr::UNSPECIFIED),
                n.hw_addr,
                n.medium,
                n.status,
                n.network_name
            ));
        }
        out
    }

    fn list_dhcp(&self) -> String {
        let mut out = String::new();
        for d in &self.dhcp {
            out.push_str(&format!(
                "NetworkName:    {}\nIP:             {}\nNetworkMask:    {}\nlowerIPAddress: {}\nupperIPAddress: {}\nEnabled:        {}\n\n",
                d.network_name,
                d.ip,
                d.netmask,
                d.lower_ip,
                d.upper_ip,
                if d.enabled { "Yes" } else { "No" }
            ));
        }
        out
    }
}

#[async_trait]
impl VBoxManager for MockVBox {
    async fn vbm_out_err(&self, args: &[&str]) -> Result<(String, String)> {
        let mut s = self.state.lock().await;
        s.calls.push(args.iter().map(|a| a.to_string()).collect());
        let out = s.exec(args)?;
        Ok((out, String::new()))
    }

    async fn vbm_pipe(
        &self,
        args: &[&str],
        input: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        {
            let mut s = self.state.lock().await;
            s.calls.push(args.iter().map(|a| a.to_string()).collect());
            if args.first().is_some_and(|c| s.fail_on.contains(*c)) {
                return Err(failed(args, "scripted failure"));
            }
        }
        // convertfromraw stdin <dest> <bytes> --format VMDK
        let dest = args.get(2).copied().unwrap_or_default();
        let declared: u64 = args
            .get(3)
            .and_then(|b| b.parse().ok())
            .ok_or_else(|| failed(args, "missing size"))?;

        let mut buf = vec![0u8; 64 << 10];
        let mut received = 0u64;
        let mut leading = 0u64;
        let mut in_payload = true;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for b in &buf[..n] {
                if in_payload && *b != 0 {
                    leading += 1;
                } else {
                    in_payload = false;
                }
            }
            received += n as u64;
        }
        if received != declared {
            return Err(failed(
                args,
                &format!("expected {} bytes, received {}", declared, received),
            ));
        }
        self.state.lock().await.converted.insert(
            dest.to_string(),
            ConvertedImage {
                declared,
                received,
                leading,
            },
        );
        Ok(())
    }
}

#[derive(Debug)]
struct MockGuestState {
    ssh_failures: u32,
    ip_output: String,
    commands: Vec<String>,
}

/// Scripted guest reachable over SSH
#[derive(Debug, Clone)]
pub struct MockGuest {
    state: Arc<Mutex<MockGuestState>>,
}

pub const MOCK_GUEST_IP: &str = "10.0.0.101";

impl Default for MockGuest {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockGuestState {
                ssh_failures: 0,
                ip_output: format!(
                    "3: eth1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc pfifo_fast state UP qlen 1000\n    link/ether 08:00:27:6d:1b:2f brd ff:ff:ff:ff:ff:ff\n    inet {}/24 brd 10.0.0.255 scope global eth1\n       valid_lft forever preferred_lft forever\n",
                    MOCK_GUEST_IP
                ),
                commands: Vec::new(),
            })),
        }
    }
}

impl MockGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connections
    pub async fn fail_ssh(&self, n: u32) {
        self.state.lock().await.ssh_failures = n;
    }

    /// Output of `ip addr show dev eth1`
    pub async fn set_ip_output(&self, output: &str) {
        self.state.lock().await.ip_output = output.to_string();
    }

    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }
}

#[async_trait]
impl GuestShell for MockGuest {
    async fn run(&self, port: u16, user: &str, key: &Path, command: &str) -> Result<String> {
        let mut s = self.state.lock().await;
        s.commands.push(command.to_string());
        if port == 0 {
            return Err(DriverError::Ssh("cannot connect to 127.0.0.1:0".to_string()));
        }
        if s.ssh_failures > 0 {
            s.ssh_failures -= 1;
            return Err(DriverError::Ssh(format!(
                "connection to 127.0.0.1:{} refused",
                port
            )));
        }
        match command {
            "exit 0" => Ok(String::new()),
            "ip addr show dev eth1" => Ok(s.ip_output.clone()),
            _ => Err(DriverError::Ssh(format!("unexpected command {}", command))),
        }
    }
}
