use std::path::PathBuf;

use clap::Parser;
use flarepc::{RegistryServer, SerializerType};
use flarepc_demo::load_config;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:20001")]
    pub addr: std::net::SocketAddr,

    /// Serializer of pushed registry messages.
    #[arg(long, default_value = "message-pack")]
    pub serializer: SerializerType,

    /// JSON config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> flarepc::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let mut config = load_config(args.config.as_deref(), "flarepc-registry")?;
    config.registry.serializer = args.serializer;

    let server = RegistryServer::new(&config);
    let addr = server.start(args.addr).await?;
    tracing::info!("registry serving on {addr}...");

    tokio::select! {
        () = server.join() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("publishers: {:?}", server.list_publisher_hosts());
            server.shutdown();
        }
    }
    Ok(())
}
