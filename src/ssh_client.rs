use crate::error::{DriverError, Result};
use async_trait::async_trait;
use log::debug;
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::net::{TcpStream, ToSocketAddrs};

const SSH_TIMEOUT_MS: u32 = 30_000;

pub struct SshClient {
    session: ssh2::Session,
}

impl SshClient {
    pub fn new() -> Result<SshClient> {
        let session = ssh2::Session::new()?;
        session.set_timeout(SSH_TIMEOUT_MS);
        Ok(SshClient { session })
    }

    pub async fn connect(
        &mut self,
        host: impl ToSocketAddrs,
        username: &str,
        key: &Path,
    ) -> Result<()> {
        // libssh2 drives the socket in blocking mode
        let tcp = TcpStream::connect(host).await?.into_std()?;
        tcp.set_nonblocking(false)?;
        self.session.set_tcp_stream(tcp);
        self.session.handshake()?;
        self.session.userauth_pubkey_file(username, None, key, None)?;
        Ok(())
    }

    pub async fn execute(&mut self, command: &str) -> Result<(i32, String)> {
        debug!("Executing command: {}", command);
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        let mut s = String::new();
        channel.read_to_string(&mut s)?;
        channel.wait_close()?;
        Ok((channel.exit_status()?, s))
    }
}

/// Runs commands inside the guest
#[async_trait]
pub trait GuestShell: Send + Sync {
    /// Run `command` on the guest whose SSH server is forwarded to 127.0.0.1:`port`
    async fn run(&self, port: u16, user: &str, key: &Path, command: &str) -> Result<String>;
}

/// [GuestShell] over SSH
#[derive(Debug, Clone, Default)]
pub struct SshGuestShell;

#[async_trait]
impl GuestShell for SshGuestShell {
    async fn run(&self, port: u16, user: &str, key: &Path, command: &str) -> Result<String> {
        let mut client = SshClient::new()?;
        client.connect(("127.0.0.1", port), user, key).await?;
        let (code, out) = client.execute(command).await?;
        if code != 0 {
            return Err(DriverError::Ssh(format!(
                "`{}` exited with {}: {}",
                command,
                code,
                out.trim()
            )));
        }
        Ok(out)
    }
}

/// Path of the public half of a key pair
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut p = private_key.as_os_str().to_owned();
    p.push(".pub");
    PathBuf::from(p)
}

/// Generate an ed25519 key pair at `path` and `path.pub`
pub fn generate_ssh_key(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    key.write_openssh_file(path, LineEnding::LF)?;
    key.public_key().write_openssh_file(&public_key_path(path))?;
    Ok(())
}
