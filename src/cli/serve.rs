use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use super::{load_config, Overrides};
use crate::llm::client::LlmClient;
use crate::llm::factory;
use crate::webhook;

pub async fn run(config_path: Option<String>, bind: Option<String>, dry_run: bool) -> Result<()> {
    let config = load_config(config_path, &Overrides::default())?;
    let bind = bind.unwrap_or_else(|| config.webhook.bind.clone());
    if dry_run {
        info!("Dry run: webhook deliveries use the mock LLM client");
    }
    let client: Arc<dyn LlmClient> = Arc::from(factory::create_client(&config, dry_run)?);
    webhook::serve(config, client, &bind).await
}
