use crate::error::{DriverError, Result};
use crate::vbox::{classify_failure, stderr_has_error, VBoxManager};
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::Command;

/// [VBoxManager] backed by the real VBoxManage binary
#[derive(Debug, Clone)]
pub struct VBoxCmdManager {
    bin: PathBuf,
}

impl VBoxCmdManager {
    pub fn new(bin: Option<PathBuf>) -> Self {
        Self {
            bin: bin.unwrap_or_else(detect_vboxmanage),
        }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }
}

impl Default for VBoxCmdManager {
    fn default() -> Self {
        Self::new(None)
    }
}

fn detect_vboxmanage() -> PathBuf {
    which::which("VBoxManage").unwrap_or_else(|_| PathBuf::from("VBoxManage"))
}

fn spawn_error(e: std::io::Error) -> DriverError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DriverError::ToolUnavailable
    } else {
        DriverError::Io(e)
    }
}

#[async_trait]
impl VBoxManager for VBoxCmdManager {
    async fn vbm_out_err(&self, args: &[&str]) -> Result<(String, String)> {
        debug!("COMMAND: {} {}", self.bin.display(), args.join(" "));

        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(spawn_error)?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!("STDOUT:\n{}", stdout);
        debug!("STDERR:\n{}", stderr);

        if !output.status.success() || stderr_has_error(&stderr) {
            return Err(classify_failure(args, &stderr));
        }
        Ok((stdout, stderr))
    }

    async fn vbm_pipe(
        &self,
        args: &[&str],
        input: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        debug!("COMMAND: {} {}", self.bin.display(), args.join(" "));

        let mut cmd = Command::new(&self.bin);
        cmd.args(args).stdin(Stdio::piped());
        if std::env::var_os("MACHINE_DEBUG").is_some() {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        }
        let mut child = cmd.spawn().map_err(spawn_error)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::UnexpectedOutput("stdin was not captured".into()))?;
        let copied = tokio::io::copy(input, &mut stdin).await;
        // the process won't exit until stdin is closed
        drop(stdin);

        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("STDERR:\n{}", stderr);

        match copied {
            Ok(written) => debug!("Wrote {} bytes to stdin", written),
            // a process that quit early usually said why
            Err(e) if !output.status.success() || !stderr.trim().is_empty() => {
                debug!("Writing stdin failed: {}", e);
                return Err(classify_failure(args, &stderr));
            }
            Err(e) => return Err(e.into()),
        }
        if !output.status.success() || stderr_has_error(&stderr) {
            return Err(classify_failure(args, &stderr));
        }
        Ok(())
    }
}
