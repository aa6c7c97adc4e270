use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use vbox_node::ssh_client::SshGuestShell;
use vbox_node::vbox::VBoxCmdManager;
use vbox_node::{NodeDriver, Settings, VmState};

#[derive(Parser)]
#[clap(about = "Manage a VirtualBox cluster node", version, author)]
struct Args {
    /// Path to the config file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Machine name
    #[clap(short, long, default_value = "default")]
    name: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the host can run a node, fetching the seed image
    PreCheck,
    /// Create and boot a new node
    Create,
    Start,
    Stop,
    Restart,
    /// Power off without a clean shutdown
    Kill,
    /// Stop and delete the node with its files
    Rm,
    /// Print the node state as JSON
    State,
    /// Print the node IP on the host-only network
    Ip,
    /// Print the Docker daemon URL
    Url,
}

#[derive(Serialize)]
struct NodeStatus {
    name: String,
    driver: &'static str,
    state: VmState,
    ssh_host: &'static str,
    ssh_port: u16,
    ssh_user: String,
    ssh_key: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = Settings::load(args.config.as_deref())?;
    let vbox = Arc::new(VBoxCmdManager::new(settings.vboxmanage.clone()));
    let mut driver = NodeDriver::new(&args.name, settings, vbox, Arc::new(SshGuestShell));

    let cancel = driver.cancel_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    match args.command {
        Command::PreCheck => {
            driver.pre_create_check().await?;
            info!("Host is ready");
        }
        Command::Create => {
            driver.pre_create_check().await?;
            driver.create().await?;
            println!("{}", driver.url());
        }
        Command::Start => {
            driver.start().await?;
            println!("{}", driver.url());
        }
        Command::Stop => driver.stop().await?,
        Command::Restart => {
            driver.load_ssh_port().await?;
            driver.restart().await?;
            println!("{}", driver.url());
        }
        Command::Kill => driver.kill().await?,
        Command::Rm => driver.remove().await?,
        Command::State => {
            let state = driver.state().await?;
            if state != VmState::NotExist {
                driver.load_ssh_port().await?;
            }
            let status = NodeStatus {
                name: driver.name().to_string(),
                driver: driver.driver_name(),
                state,
                ssh_host: driver.ssh_hostname(),
                ssh_port: driver.ssh_port(),
                ssh_user: driver.ssh_username().to_string(),
                ssh_key: driver.ssh_key_path(),
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Ip => {
            driver.load_ssh_port().await?;
            println!("{}", driver.get_ip().await?);
        }
        Command::Url => {
            driver.load_ssh_port().await?;
            let ip = driver.get_ip().await?;
            println!("tcp://{}:{}", ip, vbox_node::driver::DOCKER_PORT);
        }
    }
    Ok(())
}
