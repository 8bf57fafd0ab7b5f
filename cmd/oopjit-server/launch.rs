use std::sync::Arc;

use oopjit_common::JitConfig;
use oopjit_transport::{CompileServer, CompileService, StubCodeGenerator};
use tokio::net::TcpListener;
use tracing::info;

use crate::cli::Options;
use crate::initializers::{load_config, server_addr};

pub async fn launch(opts: &Options) -> eyre::Result<()> {
    let config = load_config(opts)?;
    let listener = TcpListener::bind(server_addr(opts, &config).await?).await?;
    let server = build_server(&config);
    let shutdown = server.shutdown_handle();
    let mut serving = tokio::spawn(server.serve(listener));

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        result = &mut serving => {
            result??;
            false
        }
    };
    if interrupted {
        info!("Server shut down started...");
        shutdown.notify_one();
        serving.await??;
    }
    info!("Server shutting down!");
    Ok(())
}

pub fn build_server(config: &JitConfig) -> CompileServer {
    let service = Arc::new(CompileService::new(
        Arc::new(StubCodeGenerator),
        config.arena.max_arena_bytes,
    ));
    CompileServer::new(service, &config.transport)
}
