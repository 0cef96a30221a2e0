//! Serve synthetic images composed from base layers and an executable image.

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::{ArgGroup, Parser, ValueEnum};
use eyre::WrapErr as _;
use overlay_registry::config::DEFAULT_CONFIG_DIR;
use overlay_registry::{BaseLayerMap, Executable, RegistryBuilder, RemoteSource};
use registry_client::{Keychain, Platform, Reference, RegistryClient};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Overlay registry
#[derive(Debug, Parser)]
#[command(name = "overlay-registry", version, about)]
#[command(group(ArgGroup::new("executable").required(true).args(["image", "upstream"])))]
struct Args {
    /// Image whose layers are served on top of the base layers
    #[arg(long, env = "OVERLAY_IMAGE")]
    image: Option<Reference>,

    /// Serve `<repository>:<tag>` from this registry instead of a single image
    #[arg(long, env = "OVERLAY_UPSTREAM")]
    upstream: Option<String>,

    /// Directory holding one file per base layer, named for the layer digest
    #[arg(long, default_value = DEFAULT_CONFIG_DIR)]
    config_dir: Utf8PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Platform to pick from multi-platform images
    #[arg(long, default_value_t = Platform::default())]
    platform: Platform,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Args {
    /// The `executable` group admits exactly one of `--image` or `--upstream`.
    fn executable(&self) -> Option<Executable> {
        if let Some(image) = &self.image {
            return Some(Executable::Pinned(image.clone()));
        }
        self.upstream.clone().map(Executable::Upstream)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let base = BaseLayerMap::from_dir(&args.config_dir)
        .wrap_err_with(|| format!("loading base layers from {}", args.config_dir))?;
    let keychain = Keychain::from_env().wrap_err("loading registry credentials")?;
    let executable = args
        .executable()
        .ok_or_else(|| eyre::eyre!("one of --image or --upstream is required"))?;

    tracing::info!(
        ?executable,
        base_layers = base.len(),
        platform = %args.platform,
        "starting overlay registry"
    );

    let source = RemoteSource::new(RegistryClient::new(keychain), args.platform.clone());
    let app = RegistryBuilder::new()
        .source(source)
        .base_layers(base)
        .executable(executable)
        .build();

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .wrap_err_with(|| format!("binding {}", args.listen))?;

    tracing::info!("listening on http://{}", args.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
