use crate::disk::generate_disk_image;
use crate::error::{DriverError, Result};
use crate::network::{
    dhcp_lease_range, get_or_create_host_only_network, list_host_only_networks,
    parse_and_validate_cidr, pick_random_dhcp_address, random_low_octet,
};
use crate::port::set_port_forwarding;
use crate::seed::{SeedImageCache, SEED_ISO};
use crate::settings::{host_cpus, normalize_cpus, Settings};
use crate::ssh_client::{generate_ssh_key, public_key_path, GuestShell};
use crate::status::{forwarded_host_port, parse_inet_address, VmState};
use crate::vbox::{check_vbox_version, get_vm_disk_info, get_vm_info, VBoxManager};
use crate::wait::{self, wait_for, Poll};
use log::{debug, info, warn};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;

pub const DRIVER_NAME: &str = "virtualbox";
pub const DOCKER_PORT: u16 = 2376;
pub const SSH_HOSTNAME: &str = "127.0.0.1";

const SSH_KEY_NAME: &str = "id_ed25519";
const DISK_NAME: &str = "disk.vmdk";
const IMPORT_KEY_NAME: &str = "id_boot2docker";

/// Lines in `VBox.log` meaning the guest could not use hardware virtualization
const VTX_LOG_MARKERS: [&str; 3] = [
    "VT-x is disabled",
    "the host CPU does NOT support HW virtualization",
    "VERR_VMX_UNABLE_TO_START_VM",
];

fn on_off(v: bool) -> &'static str {
    if v {
        "on"
    } else {
        "off"
    }
}

/// Lifecycle of a single VirtualBox VM acting as one cluster node
///
/// Every state query goes to VBoxManage, the only thing remembered between
/// calls is the SSH host port and the last IP seen on the host-only network.
pub struct NodeDriver {
    name: String,
    settings: Settings,
    vbox: Arc<dyn VBoxManager>,
    guest: Arc<dyn GuestShell>,
    seed: SeedImageCache,
    cancel: CancellationToken,
    cpu: i32,
    memory: u32,
    ssh_port: u16,
    ip_address: Option<Ipv4Addr>,
}

impl NodeDriver {
    pub fn new(
        name: &str,
        settings: Settings,
        vbox: Arc<dyn VBoxManager>,
        guest: Arc<dyn GuestShell>,
    ) -> Self {
        Self {
            name: name.to_string(),
            seed: SeedImageCache::new(&settings.store_path),
            cpu: settings.node.cpu,
            memory: settings.node.memory,
            ssh_port: settings.node.ssh_port,
            settings,
            vbox,
            guest,
            cancel: CancellationToken::new(),
            ip_address: None,
        }
    }

    /// Cancelling this token aborts any wait in progress with [DriverError::Cancelled]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn ssh_hostname(&self) -> &'static str {
        SSH_HOSTNAME
    }

    /// Host port forwarded to the guest's port 22, 0 until the first start
    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn ssh_username(&self) -> &str {
        &self.settings.node.ssh_user
    }

    pub fn machine_dir(&self) -> PathBuf {
        self.settings.store_path.join(&self.name)
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.machine_dir().join(SSH_KEY_NAME)
    }

    pub fn disk_path(&self) -> PathBuf {
        self.machine_dir().join(DISK_NAME)
    }

    fn vbox_log_path(&self) -> PathBuf {
        // VirtualBox puts the VM folder inside the base folder
        self.machine_dir()
            .join(&self.name)
            .join("Logs")
            .join("VBox.log")
    }

    /// Last IP observed on the host-only interface
    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.ip_address
    }

    /// Docker daemon URL, empty while no IP is known
    pub fn url(&self) -> String {
        match self.ip_address {
            Some(ip) => format!("tcp://{}:{}", ip, DOCKER_PORT),
            None => String::new(),
        }
    }

    /// Checks which have to pass before anything is written to disk
    pub async fn pre_create_check(&self) -> Result<()> {
        let version = self.vbox.vbm_out(&["--version"]).await?;
        check_vbox_version(&version)?;

        if !self.settings.node.no_vtx_check && host_vtx_disabled().await {
            return Err(DriverError::VirtualizationRequired);
        }

        // a failed download must not leave a half created machine behind
        self.seed
            .update_cache(self.settings.node.seed_url.as_deref())
            .await?;

        list_host_only_networks(self.vbox.as_ref()).await?;
        Ok(())
    }

    pub async fn create(&mut self) -> Result<()> {
        let machine_dir = self.machine_dir();
        self.seed
            .copy_to_machine_dir(self.settings.node.seed_url.as_deref(), &machine_dir)
            .await?;

        info!("Creating VirtualBox VM {}", self.name);
        if let Some(template) = self.settings.node.import_vm.clone() {
            self.import_template(&template).await?;
        } else {
            info!("Creating SSH key...");
            generate_ssh_key(&self.ssh_key_path())?;

            debug!("Creating disk image...");
            generate_disk_image(
                self.vbox.as_ref(),
                &public_key_path(&self.ssh_key_path()),
                &self.disk_path(),
                self.settings.node.disk_size,
            )
            .await?;
        }

        let base = machine_dir.to_string_lossy();
        self.vbm(&[
            "createvm",
            "--basefolder",
            &base,
            "--name",
            &self.name,
            "--register",
        ])
        .await?;

        let node = &self.settings.node;
        let cpus = normalize_cpus(self.cpu, host_cpus()).to_string();
        let memory = self.memory.to_string();
        debug!("VM CPUS: {}", cpus);
        debug!("VM Memory: {}", memory);

        self.vbm(&[
            "modifyvm",
            &self.name,
            "--firmware",
            "bios",
            "--bioslogofadein",
            "off",
            "--bioslogofadeout",
            "off",
            "--bioslogodisplaytime",
            "0",
            "--biosbootmenu",
            "disabled",
            "--ostype",
            "Linux26_64",
            "--cpus",
            &cpus,
            "--memory",
            &memory,
            "--acpi",
            "on",
            "--ioapic",
            "on",
            "--rtcuseutc",
            "on",
            "--natdnshostresolver1",
            on_off(node.host_dns_resolver),
            "--natdnsproxy1",
            on_off(node.dns_proxy),
            "--cpuhotplug",
            "off",
            "--pae",
            "on",
            "--hpet",
            "on",
            "--hwvirtex",
            "on",
            "--nestedpaging",
            "on",
            "--largepages",
            "on",
            "--vtxvpid",
            "on",
            "--accelerate3d",
            "off",
            "--boot1",
            "dvd",
        ])
        .await?;

        self.vbm(&[
            "modifyvm",
            &self.name,
            "--nic1",
            "nat",
            "--nictype1",
            "82540EM",
            "--cableconnected1",
            "on",
        ])
        .await?;

        self.setup_host_only_network().await?;

        self.vbm(&[
            "storagectl",
            &self.name,
            "--name",
            "SATA",
            "--add",
            "sata",
            "--hostiocache",
            "on",
        ])
        .await?;

        let iso = machine_dir.join(SEED_ISO);
        let disk = self.disk_path();
        for (port, kind, medium) in [("0", "dvddrive", &iso), ("1", "hdd", &disk)] {
            self.vbm(&[
                "storageattach",
                &self.name,
                "--storagectl",
                "SATA",
                "--port",
                port,
                "--device",
                "0",
                "--type",
                kind,
                "--medium",
                &medium.to_string_lossy(),
            ])
            .await?;
        }

        // guest additions automount shares at the root
        for key in [
            "/VirtualBox/GuestAdd/SharedFolders/MountPrefix",
            "/VirtualBox/GuestAdd/SharedFolders/MountDir",
        ] {
            self.vbm(&["guestproperty", "set", &self.name, key, "/"])
                .await?;
        }

        self.setup_share().await?;

        self.start().await
    }

    async fn import_template(&mut self, template: &str) -> Result<()> {
        info!("Importing VM {}", template);
        // the disk can't be cloned while the template is running
        if let Err(e) = self.vbm(&["controlvm", template, "poweroff"]).await {
            debug!("Template {} not powered off: {}", template, e);
        }

        let disk = get_vm_disk_info(self.vbox.as_ref(), template).await?;
        fs::metadata(&disk.path).await?;
        let dest = self.disk_path();
        self.vbm(&["clonehd", &disk.path, &dest.to_string_lossy()])
            .await?;

        debug!("Importing VM settings...");
        let vm = get_vm_info(self.vbox.as_ref(), template).await?;
        self.cpu = vm.cpus as i32;
        self.memory = vm.memory;

        debug!("Importing SSH key...");
        let key = match &self.settings.node.import_ssh_key {
            Some(k) => k.clone(),
            None => home_dir()
                .ok_or_else(|| DriverError::Config("no home directory to import SSH key from".into()))?
                .join(".ssh")
                .join(IMPORT_KEY_NAME),
        };
        fs::copy(&key, self.ssh_key_path()).await?;
        let pub_key = public_key_path(&key);
        if fs::try_exists(&pub_key).await? {
            fs::copy(&pub_key, public_key_path(&self.ssh_key_path())).await?;
        }
        Ok(())
    }

    async fn setup_share(&self) -> Result<()> {
        let Some(share) = self.settings.node.share() else {
            return Ok(());
        };
        if !fs::try_exists(&share.host_path).await? {
            debug!(
                "Share {} does not exist, skipping",
                share.host_path.display()
            );
            return Ok(());
        }
        let name = share.vbox_name();
        debug!("Sharing {} as {}", share.host_path.display(), name);
        self.vbm(&[
            "sharedfolder",
            "add",
            &self.name,
            "--name",
            &name,
            "--hostpath",
            &share.host_path.to_string_lossy(),
            "--automount",
        ])
        .await?;

        let symlinks = format!("VBoxInternal2/SharedFoldersEnableSymlinksCreate/{}", name);
        self.vbm(&["setextradata", &self.name, &symlinks, "1"])
            .await
    }

    pub async fn start(&mut self) -> Result<()> {
        let state = self.get_state().await?;

        if state == VmState::Stopped {
            // the host-only network may have been removed while the VM was off
            self.setup_host_only_network().await?;
        }

        match state {
            VmState::Stopped | VmState::Saved => {
                let policy = &self.settings.wait;
                self.ssh_port = set_port_forwarding(
                    self.vbox.as_ref(),
                    &self.name,
                    1,
                    "ssh",
                    "tcp",
                    22,
                    self.ssh_port,
                    policy.port_attempts,
                    policy.port_backoff(),
                )
                .await?;
                self.vbm(&["startvm", &self.name, "--type", "headless"])
                    .await?;
                info!("Starting VM {}...", self.name);
            }
            VmState::Paused => {
                self.vbm(&["controlvm", &self.name, "resume", "--type", "headless"])
                    .await?;
                info!("Resuming VM {}...", self.name);
            }
            s => warn!("VM {} not in restartable state ({})", self.name, s),
        }

        if self.ssh_port == 0 {
            // the forward was set up by another driver
            self.load_ssh_port().await?;
        }

        if self.is_vtx_disabled_in_vm().await? {
            return Err(DriverError::VirtualizationRequired);
        }

        self.wait_for_ip().await
    }

    /// Scan the VM log for signs that the guest could not use VT-x/AMD-v
    pub async fn is_vtx_disabled_in_vm(&self) -> Result<bool> {
        let path = self.vbox_log_path();
        debug!("Checking vm logs: {}", path.display());
        let log = fs::read_to_string(&path).await?;
        Ok(log
            .lines()
            .any(|l| VTX_LOG_MARKERS.iter().any(|m| l.contains(m))))
    }

    /// Wait for SSH over NAT, then for an address on the host-only interface
    pub async fn wait_for_ip(&mut self) -> Result<()> {
        let this: &Self = self;
        let policy = &this.settings.wait;

        let ssh = Poll::new(policy.ssh_attempts, policy.ssh_interval());
        debug!("Waiting for SSH on port {}", this.ssh_port);
        if !wait_for(&this.cancel, ssh, || async move { Ok(this.ssh_available().await) }).await? {
            return Err(DriverError::SshWaitTimeout(ssh.attempts));
        }

        let ip = Poll::new(policy.ip_attempts, policy.ip_interval());
        if !wait_for(&this.cancel, ip, || async move {
            Ok(this.host_only_ip_available().await)
        })
        .await?
        {
            return Err(DriverError::IpWaitTimeout(ip.attempts));
        }

        let addr = self.get_ip().await?;
        info!("VM {} has IP {}", self.name, addr);
        self.ip_address = Some(addr);
        Ok(())
    }

    async fn ssh_available(&self) -> bool {
        match self.guest_run("exit 0").await {
            Ok(_) => true,
            Err(e) => {
                debug!("SSH not available yet: {}", e);
                false
            }
        }
    }

    async fn host_only_ip_available(&self) -> bool {
        match self.get_ip().await {
            Ok(ip) => {
                debug!("IP is {}", ip);
                true
            }
            Err(e) => {
                debug!("Error getting IP: {}", e);
                false
            }
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        if self.get_state().await? == VmState::Paused {
            self.vbm(&["controlvm", &self.name, "resume"]).await?;
            info!("Resuming VM {}...", self.name);
        }

        self.vbm(&["controlvm", &self.name, "acpipowerbutton"])
            .await?;

        let this: &Self = self;
        let poll = Poll::new(
            this.settings.wait.stop_attempts,
            this.settings.wait.stop_interval(),
        );
        let stopped = wait_for(&this.cancel, poll, || async move {
            Ok(this.get_state().await? != VmState::Running)
        })
        .await?;
        if !stopped {
            return Err(DriverError::StopTimeout(poll.attempts));
        }
        info!("Stopped VM {}", self.name);

        self.ip_address = None;
        Ok(())
    }

    /// Reset a VM which is known to be running
    pub async fn restart(&mut self) -> Result<()> {
        info!("Restarting VM {}...", self.name);
        self.vbm(&["controlvm", &self.name, "reset"]).await?;
        self.ip_address = None;
        self.wait_for_ip().await
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.vbm(&["controlvm", &self.name, "poweroff"]).await?;
        self.ip_address = None;
        Ok(())
    }

    /// Stop the VM if needed and delete it along with its files
    ///
    /// A machine which does not exist counts as removed.
    pub async fn remove(&mut self) -> Result<()> {
        let state = match self.get_state().await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                info!(
                    "Machine {} does not exist, assuming it has been removed already",
                    self.name
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match state {
            VmState::Running => self.stop().await?,
            VmState::Stopped => {}
            _ => self.kill().await?,
        }
        // VirtualBox holds the session lock for a moment after the VM stopped
        wait::sleep(&self.cancel, self.settings.wait.lock_release_delay()).await?;
        self.vbm(&["unregistervm", "--delete", &self.name]).await
    }

    /// Pick up the SSH host port from the VM's forwarding rules, for a
    /// driver attached to a VM started elsewhere
    pub async fn load_ssh_port(&mut self) -> Result<u16> {
        let out = self
            .vbox
            .vbm_out(&["showvminfo", &self.name, "--machinereadable"])
            .await?;
        if let Some(port) = forwarded_host_port(&out, "ssh") {
            self.ssh_port = port;
        }
        Ok(self.ssh_port)
    }

    /// Current state, a missing machine is an error
    pub async fn get_state(&self) -> Result<VmState> {
        let out = self
            .vbox
            .vbm_out(&["showvminfo", &self.name, "--machinereadable"])
            .await?;
        Ok(VmState::from_machine_readable(&out))
    }

    /// Current state with a missing machine reported as [VmState::NotExist]
    pub async fn state(&self) -> Result<VmState> {
        match self.get_state().await {
            Err(e) if e.is_not_found() => Ok(VmState::NotExist),
            r => r,
        }
    }

    /// Ask the guest for its address on the host-only interface
    pub async fn get_ip(&self) -> Result<Ipv4Addr> {
        // the address comes from DHCP, only a running guest has one
        if self.get_state().await? != VmState::Running {
            return Err(DriverError::HostNotRunning);
        }
        let out = self.guest_run("ip addr show dev eth1").await?;
        debug!("SSH returned: {}", out);
        parse_inet_address(&out).ok_or_else(|| DriverError::NoIpAddress(out.trim().to_string()))
    }

    /// Attach NIC 2 to the host-only network for the configured CIDR,
    /// creating the network and its DHCP server when missing
    pub async fn setup_host_only_network(&self) -> Result<()> {
        let node = &self.settings.node;
        let (host_ip, network) = parse_and_validate_cidr(&node.host_only_cidr)?;
        let dhcp_ip = pick_random_dhcp_address(host_ip, random_low_octet)?;
        let (lower, upper) = dhcp_lease_range(&network);
        debug!("Using {} for dhcp address", dhcp_ip);

        let net = get_or_create_host_only_network(
            self.vbox.as_ref(),
            host_ip,
            network.mask(),
            dhcp_ip,
            lower,
            upper,
        )
        .await?;

        self.vbm(&[
            "modifyvm",
            &self.name,
            "--nic2",
            "hostonly",
            "--nictype2",
            &node.host_only_nic_type,
            "--nicpromisc2",
            &node.host_only_promisc_mode,
            "--hostonlyadapter2",
            &net.name,
            "--cableconnected2",
            "on",
        ])
        .await
    }

    async fn guest_run(&self, command: &str) -> Result<String> {
        self.guest
            .run(
                self.ssh_port,
                self.ssh_username(),
                &self.ssh_key_path(),
                command,
            )
            .await
    }

    async fn vbm(&self, args: &[&str]) -> Result<()> {
        self.vbox.vbm(args).await
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// True when the host CPU flags show neither VT-x nor AMD-v
async fn host_vtx_disabled() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    match fs::read_to_string("/proc/cpuinfo").await {
        Ok(info) => !cpuinfo_has_virtualization(&info),
        Err(e) => {
            warn!("Could not read /proc/cpuinfo: {}", e);
            false
        }
    }
}

fn cpuinfo_has_virtualization(cpuinfo: &str) -> bool {
    cpuinfo
        .lines()
        .filter(|l| l.starts_with("flags"))
        .any(|l| l.split_whitespace().any(|f| f == "vmx" || f == "svm"))
}
