use anyhow::Context;
use dispatch_placement::Dispatcher;
use dispatch_state::{HostRecord, StateStore};
use tracing::info;

use super::print_json;

fn register(store: &StateStore, json: &str) -> anyhow::Result<HostRecord> {
    let host: HostRecord = serde_json::from_str(json).context("invalid host record")?;
    let stored = store.put_host(&host)?;
    info!(ip = %stored.ip, "host registered");
    Ok(stored)
}

pub fn put(store: &StateStore, json: &str) -> anyhow::Result<()> {
    print_json(&register(store, json)?)
}

pub fn list(store: &StateStore) -> anyhow::Result<()> {
    print_json(&store.list_hosts()?)
}

pub fn dedicate(store: &StateStore, project: &str, ips: &[String]) -> anyhow::Result<()> {
    store.set_dedicated_hosts(project, ips)?;
    info!(%project, count = ips.len(), "dedicated hosts updated");
    print_json(&serde_json::json!({
        "project_id": project,
        "dedicated": store.get_dedicated_hosts(project)?,
    }))
}

pub async fn proxy_url(
    dispatcher: &Dispatcher,
    uri: &str,
    ip: &str,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let url = dispatcher.proxy().proxy_url(uri, ip, port).await?;
    print_json(&serde_json::json!({ "url": url }))
}
