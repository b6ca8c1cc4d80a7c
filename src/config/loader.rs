//! Configuration loader with environment variable support

use super::Config;
use crate::error::Result;
use config::{Environment, File};
use std::path::Path;
use tracing::debug;

/// Prefix for nested overrides, e.g. `VECTORDB__QUEUE__MAX_SIZE=500`
pub const ENV_PREFIX: &str = "VECTORDB";

/// Load configuration from a TOML file with environment variable overrides
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = config::Config::builder()
        .add_source(File::from(path.as_ref()))
        .add_source(nested_environment())
        .build()?;

    let mut cfg: Config = config.try_deserialize()?;
    apply_server_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// Load configuration from defaults plus environment variables
pub fn load_from_env() -> Result<Config> {
    let config = config::Config::builder()
        .add_source(nested_environment())
        .build()?;

    let mut cfg: Config = config.try_deserialize()?;
    apply_server_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

fn nested_environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

/// Apply the flat `CHROMA_SERVER_*` variables the desktop app exports.
///
/// `CHROMA_SERVER_URL` wins over the individual parts. An unparsable port is
/// ignored and left to validation of the remaining settings.
pub fn apply_server_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(url) = non_empty("CHROMA_SERVER_URL") {
        debug!("Using CHROMA_SERVER_URL override");
        config.server.url = Some(url);
    }
    if let Some(protocol) = non_empty("CHROMA_SERVER_PROTOCOL") {
        config.server.protocol = protocol.to_lowercase();
    }
    if let Some(host) = non_empty("CHROMA_SERVER_HOST") {
        config.server.host = host;
    }
    if let Some(port) = non_empty("CHROMA_SERVER_PORT") {
        match port.parse::<u16>() {
            Ok(port) => config.server.port = port,
            Err(_) => debug!("Ignoring invalid CHROMA_SERVER_PORT value: {}", port),
        }
    }
}
