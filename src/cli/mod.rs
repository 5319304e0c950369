pub mod analyze;
pub mod serve;
pub mod split;

use anyhow::Result;
use tracing::info;

use crate::config::Config;

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub concurrency: Option<usize>,
}

/// Load configuration (explicit path, `./repotest.toml`, user config dir)
/// and apply CLI overrides on top.
pub fn load_config(path: Option<String>, overrides: &Overrides) -> Result<Config> {
    let mut config = Config::load_with_path(path)?;
    apply_overrides(&mut config, overrides);
    Ok(config)
}

fn apply_overrides(config: &mut Config, overrides: &Overrides) {
    if let Some(ref provider) = overrides.provider {
        info!("CLI override: provider = {}", provider);
        config.llm.provider = provider.clone();
    }
    if let Some(ref model) = overrides.model {
        info!("CLI override: model = {}", model);
        config.llm.model = model.clone();
    }
    if let Some(concurrency) = overrides.concurrency {
        info!("CLI override: max_concurrency = {}", concurrency);
        config.pipeline.max_concurrency = concurrency.max(1);
    }
}
