use std::path::PathBuf;

use clap::{Parser as ClapParser, Subcommand as ClapSubcommand};
use oopjit_common::config::CONFIG_PATH_ENV;
use oopjit_transport::TransportSession;
use tracing::{Level, info};
use uuid::Uuid;

use crate::initializers::{load_config, server_addr};

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(name = "oopjit-server", author, version = VERSION_STRING, about = "Out-of-process JIT compile server", long_about = None)]
pub struct CLI {
    #[clap(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Option<Subcommand>,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "addr",
        value_name = "ADDRESS",
        env = "OOPJIT_SERVER_LISTEN_ADDR",
        help = "Address to listen on. Overrides the config file."
    )]
    pub addr: Option<String>,
    #[arg(
        long = "port",
        value_name = "PORT",
        env = "OOPJIT_SERVER_PORT",
        help = "Port to listen on. Overrides the config file."
    )]
    pub port: Option<u16>,
    #[arg(
        long = "config",
        value_name = "CONFIG_FILE",
        env = CONFIG_PATH_ENV,
        help = "TOML file with the JIT configuration. Without it, OOPJIT_* environment variables and defaults are used."
    )]
    pub config: Option<PathBuf>,
    #[arg(long = "log.level", default_value_t = Level::INFO, value_name = "LOG_LEVEL")]
    pub log_level: Level,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addr: None,
            port: None,
            config: None,
            log_level: Level::INFO,
        }
    }
}

#[derive(ClapSubcommand, Debug)]
pub enum Subcommand {
    #[command(name = "shutdown", about = "Ask a running compile server to stop")]
    Shutdown,
    #[command(name = "show-config", about = "Print the resolved configuration and exit")]
    ShowConfig,
}

impl Subcommand {
    pub async fn run(self, opts: &Options) -> eyre::Result<()> {
        let config = load_config(opts)?;
        match self {
            Subcommand::Shutdown => {
                let addr = server_addr(opts, &config).await?;
                let session = TransportSession::new(config.transport.clone());
                session.request_server_shutdown(addr, Uuid::new_v4()).await?;
                info!("Compile server at {addr} acknowledged shutdown");
            }
            Subcommand::ShowConfig => {
                println!("{config:#?}");
            }
        }
        Ok(())
    }
}
