use clap::{Parser, Subcommand};
use hostdev_core::fuse::FuseLister;
use hostdev_core::kvm::KvmLister;
use hostdev_core::netlink::{ExitCleaner, ProcessMonitor};
use hostdev_core::network::bridge::{parse_bridges, BridgeLister, BRIDGES_ENV};
use hostdev_core::network::IpLinkManager;
use hostdev_core::pci::{IommuLock, PciLister, SysfsPciBus};
use hostdev_core::random::RandomLister;
use hostdev_core::runtime::DockerCli;
use hostdev_core::video::VideoLister;
use hostdev_core::{init_observability, Lister, Manager, ManagerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hostdev-plugin", version, about = "Kubelet device plugins for host resources")]
struct Cli {
    /// Directory holding kubelet.sock and the plugin sockets
    #[arg(long, global = true, env = "HOSTDEV_PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pass PCI devices through VFIO, one resource per vendor:device family
    Pci,
    /// Hand out ports on existing Linux bridges
    Bridge {
        /// Comma-separated bridge names
        #[arg(long, env = BRIDGES_ENV)]
        bridges: String,
    },
    /// Share /dev/kvm
    Kvm,
    /// Share /dev/hwrng
    Random,
    /// Share /dev/fuse
    Fuse,
    /// Share /dev/video0 to /dev/video9, one resource per node
    Video,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize observability FIRST
    init_observability().map_err(|e| anyhow::anyhow!("observability: {}", e))?;

    let cli = Cli::parse();

    let mut config = ManagerConfig::from_env()?;
    if let Some(dir) = cli.plugin_dir {
        config.device_plugin_dir = dir;
        config.validate()?;
    }

    info!(dir = %config.device_plugin_dir.display(), "hostdev-plugin starting");

    match cli.command {
        Command::Pci => {
            let lister = PciLister::new(Arc::new(SysfsPciBus::default()), IommuLock::new());
            run(lister, config).await?;
        }
        Command::Bridge { bridges } => {
            let bridges = parse_bridges(&bridges)?;
            let links = Arc::new(IpLinkManager);
            let cleaner = ExitCleaner::new(links.clone());

            match ProcessMonitor::open() {
                Ok(monitor) => {
                    tokio::spawn(cleaner.clone().run(monitor));
                }
                Err(e) => warn!("Host interfaces will not be cleaned up on container exit: {}", e),
            }

            let lister = BridgeLister::new(bridges, Arc::new(DockerCli::new()), links)
                .with_cleaner(cleaner);
            run(lister, config).await?;
        }
        Command::Kvm => run(KvmLister::default(), config).await?,
        Command::Random => run(RandomLister::default(), config).await?,
        Command::Fuse => run(FuseLister::default(), config).await?,
        Command::Video => run(VideoLister::default(), config).await?,
    }

    info!("hostdev-plugin shutting down");
    Ok(())
}

async fn run<L: Lister>(lister: L, config: ManagerConfig) -> hostdev_core::Result<()> {
    Manager::new(lister, config).run().await
}
