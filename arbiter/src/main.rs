use std::path::PathBuf;

use structopt::StructOpt;
use tracing::debug;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use arbiter::config::Config;

#[derive(Debug, StructOpt)]
#[structopt(name = "arbiter", about = "Chess analysis server")]
struct Opt {
    /// Config file
    #[structopt(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> arbiter::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .init();

    let opt = Opt::from_args();
    debug!(?opt, "Arbiter starting");

    let config = Config::load(&opt.config)?;
    debug!(?config, "Configuration loaded");

    arbiter::server::run(config).await
}
