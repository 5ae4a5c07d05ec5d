use anyhow::Result;
use clap::Parser;
use stevedore_api::stevedore::v1::build_service_server::BuildServiceServer;
use stevedore_core::DiscoveryOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod proto_convert;
mod server;

#[derive(Parser, Debug, Clone)]
#[command(name = "stevedored")]
#[command(about = "Stevedore build agent daemon", long_about = None)]
struct Args {
    /// Address the build service listens on
    #[arg(long, env = "STEVEDORE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: std::net::SocketAddr,

    /// Directory holding per-build context directories
    #[arg(long, env = "STEVEDORE_TEMP_DIR")]
    temp_dir: Option<std::path::PathBuf>,

    /// Fixed builder pod namespace; omit to derive it from the app resource
    #[arg(long, env = "STEVEDORE_BUILDER_NAMESPACE")]
    builder_namespace: Option<String>,

    /// Label selector matching builder pods
    #[arg(long, env = "STEVEDORE_POD_SELECTOR", default_value = "app=buildkit")]
    pod_selector: String,

    /// Build engine port on builder pods
    #[arg(long, env = "STEVEDORE_BUILDER_PORT", default_value_t = 1234)]
    builder_port: u16,

    /// Prefix of the per-pod lease names
    #[arg(long, env = "STEVEDORE_LEASE_PREFIX", default_value = "stevedore-build")]
    lease_prefix: String,

    /// Label the claimed builder pod with app ownership
    #[arg(
        long,
        env = "STEVEDORE_SET_APP_LABEL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    set_app_label: bool,
}

impl Args {
    fn agent_config(&self) -> server::AgentConfig {
        server::AgentConfig {
            temp_dir: self.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
            discovery: DiscoveryOptions {
                namespace: self.builder_namespace.clone(),
                pod_selector: self.pod_selector.clone(),
                port: self.builder_port,
                lease_prefix: self.lease_prefix.clone(),
                set_app_label: self.set_app_label,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .init();

    let args = Args::parse();
    info!(listen = %args.listen, "stevedored starting");

    let kube_client = kube::Client::try_default().await?;
    let service = server::BuildServiceImpl::new(kube_client, args.agent_config());

    tonic::transport::Server::builder()
        .add_service(BuildServiceServer::new(service))
        .serve_with_shutdown(args.listen, async {
            tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
            info!("Received shutdown signal");
        })
        .await?;

    info!("stevedored shutting down");
    Ok(())
}
