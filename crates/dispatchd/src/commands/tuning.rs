use std::collections::BTreeMap;

use anyhow::Context;
use dispatch_placement::Dispatcher;
use dispatch_state::LoadThresholdTier;

use super::print_json;

pub async fn show_load_config(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    let tiers = dispatcher.load_config().get().await;
    print_json(&tiers.to_map())
}

pub async fn set_load_config(dispatcher: &Dispatcher, json: &str) -> anyhow::Result<()> {
    let map: BTreeMap<String, LoadThresholdTier> =
        serde_json::from_str(json).context("invalid load config")?;
    dispatcher.load_config().set(&map).await?;
    show_load_config(dispatcher).await
}

pub async fn show_drift_threshold(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    let threshold = dispatcher.load_config().drift_threshold().await;
    print_json(&serde_json::json!({ "drift_threshold": threshold }))
}

pub async fn set_drift_threshold(dispatcher: &Dispatcher, value: u32) -> anyhow::Result<()> {
    dispatcher.load_config().set_drift_threshold(value).await?;
    show_drift_threshold(dispatcher).await
}
