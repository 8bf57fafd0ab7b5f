use clap::Parser;
use oopjit_server::cli::CLI;
use oopjit_server::initializers::init_tracing;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let CLI { opts, command } = CLI::parse();
    init_tracing(&opts);

    match command {
        Some(command) => command.run(&opts).await,
        None => oopjit_server::launch::launch(&opts).await,
    }
}
