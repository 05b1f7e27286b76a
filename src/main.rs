#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use waypoint_gateway::server;

#[derive(Parser)]
#[command(
    name = "waypoint-gateway",
    about = "API gateway with a built-in service registry"
)]
struct Cli {
    /// Path to gateway config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Proxy listen address, overrides `server.listen`
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address, overrides `server.admin_listen`
    #[arg(long)]
    admin_listen: Option<String>,

    /// Tokio worker threads (defaults to the number of CPUs)
    #[arg(long)]
    worker_threads: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = cli.worker_threads {
        builder.worker_threads(n.max(1));
    }
    let rt = builder.enable_all().build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
