//! Layered pool configuration: defaults, then an optional TOML file, then `TVBUF_*` environment
//! variables. Every file/env field is optional so each layer only overrides what it names.

use crate::error::BufferError;
use crate::pool::PoolConfig;

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Prefix of the environment variables read by [`load_pool_config`], e.g. `TVBUF_ARRAY_SIZE`.
pub const ENV_PREFIX: &str = "TVBUF";

/// Pool settings as read from file + env.
#[derive(Debug, Default, Deserialize)]
pub struct PoolFileConfig {
    pub array_size: Option<usize>,
    pub max_plain_chunks: Option<usize>,
    pub max_persistent_chunks: Option<usize>,
    /// Directory of the persistent heap. An empty string keeps it disabled.
    pub pmem_dir: Option<String>,
    pub text_slot_bytes: Option<usize>,
}

/// Loads and validates a pool configuration. A `path` that does not exist is an error; pass `None`
/// to read the environment only.
pub fn load_pool_config(path: Option<&Path>) -> Result<PoolConfig, BufferError> {
    load_pool_config_with_prefix(path, ENV_PREFIX)
}

/// As [`load_pool_config`], reading environment variables under `env_prefix` instead.
pub fn load_pool_config_with_prefix(
    path: Option<&Path>,
    env_prefix: &str,
) -> Result<PoolConfig, BufferError> {
    let partial = read_partial(path, env_prefix)?;
    let mut config = PoolConfig::default();
    merge_into_pool_config(&mut config, &partial);
    config.validate()?;
    Ok(config)
}

fn read_partial(path: Option<&Path>, env_prefix: &str) -> Result<PoolFileConfig, BufferError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        if !path.exists() {
            return Err(BufferError::ConfigError(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    }
    builder = builder.add_source(
        Environment::with_prefix(env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );
    let merged = builder.build()?;
    Ok(merged.try_deserialize()?)
}

/// Overwrites the fields of `base` that are `Some` in `partial`.
pub fn merge_into_pool_config(base: &mut PoolConfig, partial: &PoolFileConfig) {
    if let Some(n) = partial.array_size {
        base.array_size = n;
    }
    if let Some(n) = partial.max_plain_chunks {
        base.max_plain_chunks = Some(n);
    }
    if let Some(n) = partial.max_persistent_chunks {
        base.max_persistent_chunks = Some(n);
    }
    if let Some(dir) = &partial.pmem_dir {
        base.pmem_dir = if dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(dir))
        };
    }
    if let Some(n) = partial.text_slot_bytes {
        base.text_slot_bytes = n;
    }
}
