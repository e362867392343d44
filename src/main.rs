use eyre::Result;
use feed_keeper::KeeperServiceBuilder;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG_PATH: &str = "keeper.toml";

/// `RUST_LOG` picks the filter, `KEEPER_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feed_keeper=info,warn"));
    let json = std::env::var("KEEPER_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

/// First argument, then `KEEPER_CONFIG`, then `keeper.toml`.
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KEEPER_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let path = config_path();
    info!(%path, "Loading keeper configuration");
    let mut service = KeeperServiceBuilder::new().with_config_file(path).build().await?;
    service.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    service.stop().await
}
