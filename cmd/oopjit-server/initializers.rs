use std::net::SocketAddr;

use eyre::OptionExt;
use oopjit_common::JitConfig;
use tokio::net::lookup_host;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let subscriber = Registry::default().with(fmt::layer().with_filter(log_filter));
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Couldn't set the tracing subscriber: {err}");
    }
}

/// The config file named on the command line wins over the environment.
pub fn load_config(opts: &Options) -> eyre::Result<JitConfig> {
    let mut config = match &opts.config {
        Some(path) => JitConfig::from_file(path)?,
        None => JitConfig::load()?,
    };
    if let Some(addr) = &opts.addr {
        config.server.listen_addr.clone_from(addr);
    }
    if let Some(port) = opts.port {
        config.server.port = port;
    }
    debug!(?config, "Loaded JIT config");
    Ok(config)
}

pub async fn server_addr(opts: &Options, config: &JitConfig) -> eyre::Result<SocketAddr> {
    let host = (config.server.listen_addr.as_str(), config.server.port);
    let addr = lookup_host(host)
        .await?
        .next()
        .ok_or_eyre("listen address did not resolve")?;
    if opts.addr.is_some() || opts.port.is_some() {
        info!("Using command line address {addr}");
    }
    Ok(addr)
}
