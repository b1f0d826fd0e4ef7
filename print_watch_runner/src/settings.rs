// THEORY:
// Configuration is layered: the engine defaults, then an optional TOML file,
// then `PRINT_WATCH_*` environment variables. The merged result is validated
// here so a bad value stops the runner before any frame is read.

use anyhow::Context;
use config::{Config, Environment, File};
use print_watch::WatchConfig;
use std::path::Path;

pub const ENV_PREFIX: &str = "PRINT_WATCH";

pub fn load(path: Option<&Path>) -> anyhow::Result<WatchConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }
    let settings = builder
        .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()
        .context("failed to read configuration")?;

    let config: WatchConfig = settings
        .try_deserialize()
        .context("failed to parse configuration")?;
    config.validate()?;
    Ok(config)
}
