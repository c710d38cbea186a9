//! Sync command handler

use anyhow::{bail, Context, Result};
use serde_json::json;

use sealsync_core::{LifecycleEvent, SyncEvent};

use crate::engine::{parse_document_id, Engine};
use crate::output::{Output, OutputFormat};

/// Sync a document with the relay
///
/// Bootstraps, pushes anything unpushed, and optionally compacts. With
/// `watch`, stays connected and reports peer updates until interrupted.
pub async fn sync(
    engine: &Engine,
    document: &str,
    snapshot: bool,
    watch: bool,
    output: &Output,
) -> Result<()> {
    let config = &engine.config;

    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             sealsync config set sync_enabled true\n  \
             sealsync config set relay_url ws://your-relay:3030"
        );
    }

    let Some(ref relay_url) = config.relay_url else {
        bail!(
            "Relay URL not configured. Set it with:\n  \
             sealsync config set relay_url ws://your-relay:3030"
        );
    };

    let document_id = parse_document_id(document)?;
    output.message(&format!("Syncing {} with {}...", document_id, relay_url));

    let mut coordinator = engine.coordinator(document_id, output).await?;
    let mut events = coordinator.take_events();

    coordinator.force_sync().await.context("Push failed")?;
    if snapshot {
        coordinator
            .create_snapshot()
            .await
            .context("Snapshot failed")?;
    }

    let unpushed = coordinator.store().unpushed_count(&document_id)?;
    match output.format {
        OutputFormat::Json => output.json(&json!({
            "document_id": document_id.to_bs58check(),
            "status": coordinator.status(),
            "unpushed": unpushed,
            "snapshot_version": coordinator.snapshot_version(),
        })),
        _ if unpushed == 0 => output.success("Sync complete - relay has every local change"),
        _ => output.success(&format!("Sync complete - {} op(s) still pending", unpushed)),
    }

    if watch {
        output.message("Watching for changes (Ctrl-C to stop)...");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Some(SyncEvent::RemoteUpdate) => output.message("Received update from peer"),
                    Some(SyncEvent::Error(message)) => output.warn(&message),
                    Some(SyncEvent::StatusChanged(status)) => {
                        tracing::debug!("Status: {}", status)
                    }
                    Some(SyncEvent::UnsavedChanges) => {}
                    None => break,
                },
            }
        }

        if coordinator
            .handle_lifecycle(LifecycleEvent::Terminating)
            .await?
        {
            output.warn("Exiting with changes the relay has not acknowledged.");
        }
    }

    coordinator.disconnect().await?;
    Ok(())
}
