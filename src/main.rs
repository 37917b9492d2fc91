use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use gridwire::config::{self, Config};
use gridwire::SqlConnection;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config();
    let statements: Vec<String> = std::env::args().skip(1).collect();

    if let Err(e) = run(&config, &statements) {
        error!(error = %e, "gridwire failed");
        return Err(e);
    }
    Ok(())
}

fn run(config: &Config, statements: &[String]) -> anyhow::Result<()> {
    let connection = SqlConnection::connect(config)?;
    info!(
        cluster = %config.cluster.name,
        uuid = %connection.uuid(),
        "Connected to cluster"
    );

    let mut session = connection.create_session()?;
    for sql in statements {
        let table_found = session.execute(sql)?;
        let result = session.last_result()?;
        match &result.page {
            Some(page) if table_found => info!(
                sql = %sql,
                query_id = result.query_id,
                rows = page.row_count,
                following = page.following_exists,
                "Statement returned rows"
            ),
            _ => info!(sql = %sql, update_count = result.update_count, "Statement executed"),
        }
    }
    session.close();

    connection.close()?;
    Ok(())
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/gridwire.toml", "gridwire.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
