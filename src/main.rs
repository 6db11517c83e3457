#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use portico_gateway::plugin::PluginRegistry;
use portico_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "portico-gateway", about = "Versioned API gateway with replicated endpoint mappings")]
struct Cli {
    /// Path to gateway config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Admin API listen address (health, readiness, metrics, reload)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,

    /// Tokio worker threads (default: container CPU quota or available parallelism)
    #[arg(short, long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workers = server::runtime::resolve_workers(cli.workers);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(
        server::bootstrap::BootstrapArgs {
            config_path: cli.config,
            listen: cli.listen,
            admin_listen: cli.admin_listen,
            workers,
        },
        PluginRegistry::with_builtins(),
    ))
}
