use std::collections::BTreeSet;

use anyhow::Context;
use dispatch_placement::Dispatcher;
use dispatch_state::BuildStartEvent;

use super::print_json;

fn parse_event(json: &str) -> anyhow::Result<BuildStartEvent> {
    serde_json::from_str(json).context("invalid build-start event")
}

pub async fn select(
    dispatcher: &Dispatcher,
    project: &str,
    pipeline: &str,
    stage: &str,
    exclude: Vec<String>,
) -> anyhow::Result<()> {
    let excluded: BTreeSet<String> = exclude.into_iter().collect();
    let choice = dispatcher
        .selector()
        .select_host_for_project(project, pipeline, stage, &excluded)
        .await?;
    print_json(&choice)
}

pub async fn start(dispatcher: &Dispatcher, event: &str) -> anyhow::Result<()> {
    let event = parse_event(event)?;
    let started = dispatcher.start_build(&event).await?;
    print_json(&started)
}

pub async fn finish(
    dispatcher: &Dispatcher,
    event: &str,
    slot: u32,
    ip: &str,
) -> anyhow::Result<()> {
    let event = parse_event(event)?;
    dispatcher.finish_build(&event, slot, ip).await?;
    print_json(&serde_json::json!({ "slot": slot, "ip": ip, "released": true }))
}
