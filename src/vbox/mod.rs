use crate::error::{DriverError, Result};
use crate::status::parse_machine_readable;
use async_trait::async_trait;
use log::warn;
use tokio::io::AsyncRead;

mod cmd;

pub use cmd::VBoxCmdManager;

const MACHINE_NOT_FOUND: &str = "Could not find a registered machine named '";

/// Generic interface to the VBoxManage control tool
///
/// Every call spawns one process, nothing is retried here.
#[async_trait]
pub trait VBoxManager: Send + Sync {
    /// Run a command returning its stdout and stderr
    async fn vbm_out_err(&self, args: &[&str]) -> Result<(String, String)>;

    /// Run a command streaming `input` into its stdin, stdin is closed once
    /// `input` is exhausted and the call returns when the process exits
    async fn vbm_pipe(&self, args: &[&str], input: &mut (dyn AsyncRead + Send + Unpin))
        -> Result<()>;

    /// Run a command returning its stdout
    async fn vbm_out(&self, args: &[&str]) -> Result<String> {
        let (out, _) = self.vbm_out_err(args).await?;
        Ok(out)
    }

    /// Run a command discarding its output
    async fn vbm(&self, args: &[&str]) -> Result<()> {
        self.vbm_out_err(args).await?;
        Ok(())
    }
}

/// Turn the stderr of a failed command into an error
///
/// A missing machine is classified as [DriverError::MachineNotFound] so state
/// queries can tell "does not exist" apart from any other failure.
pub fn classify_failure(args: &[&str], stderr: &str) -> DriverError {
    if let Some(start) = stderr.find(MACHINE_NOT_FOUND) {
        let rest = &stderr[start + MACHINE_NOT_FOUND.len()..];
        if let Some(end) = rest.find('\'') {
            return DriverError::MachineNotFound(rest[..end].to_string());
        }
    }
    DriverError::CommandFailed {
        command: args.join(" "),
        stderr: stderr.trim().to_string(),
    }
}

/// VBoxManage sometimes exits 0 after a fatal error, e.g.
/// `VBoxManage: error: VT-x is not available. (VERR_VMX_NO_VMX)`
pub fn stderr_has_error(stderr: &str) -> bool {
    stderr.contains("error:")
}

/// Check the output of `VBoxManage --version`, e.g. `7.0.14r161095`
pub fn check_vbox_version(version: &str) -> Result<()> {
    let version = version.trim();
    let major: u32 = version
        .split('.')
        .next()
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| DriverError::UnsupportedVersion(version.to_string()))?;
    match major {
        0..=3 => Err(DriverError::UnsupportedVersion(version.to_string())),
        4 => {
            warn!(
                "You are using version {} of VirtualBox, if you encounter issues consider upgrading",
                version
            );
            Ok(())
        }
        _ => Ok(()),
    }
}

/// CPU and memory of an existing VM
#[derive(Debug, Clone, PartialEq)]
pub struct VmInfo {
    pub cpus: u32,
    /// Memory in MB
    pub memory: u32,
}

/// Primary SATA disk of an existing VM
#[derive(Debug, Clone, PartialEq)]
pub struct DiskInfo {
    pub uuid: String,
    pub path: String,
}

pub async fn get_vm_info(vbox: &dyn VBoxManager, name: &str) -> Result<VmInfo> {
    let out = vbox
        .vbm_out(&["showvminfo", name, "--machinereadable"])
        .await?;
    let info = parse_machine_readable(&out);
    let field = |k: &str| -> Result<u32> {
        info.get(k)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| DriverError::UnexpectedOutput(format!("no {} for VM {}", k, name)))
    };
    Ok(VmInfo {
        cpus: field("cpus")?,
        memory: field("memory")?,
    })
}

pub async fn get_vm_disk_info(vbox: &dyn VBoxManager, name: &str) -> Result<DiskInfo> {
    let out = vbox
        .vbm_out(&["showvminfo", name, "--machinereadable"])
        .await?;
    let mut info = parse_machine_readable(&out);
    let path = info
        .remove("SATA-1-0")
        .ok_or_else(|| DriverError::UnexpectedOutput(format!("no SATA disk for VM {}", name)))?;
    Ok(DiskInfo {
        uuid: info.remove("SATA-ImageUUID-1-0").unwrap_or_default(),
        path,
    })
}
