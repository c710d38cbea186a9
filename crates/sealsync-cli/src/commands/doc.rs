//! Document command handlers

use anyhow::{Context, Result};
use serde_json::json;

use sealsync_core::DocumentId;

use crate::engine::{parse_document_id, Coordinator, Engine};
use crate::output::{Output, OutputFormat};

/// Print a fresh document ID
pub fn new(output: &Output) -> Result<()> {
    let id = DocumentId::new();
    match output.format {
        OutputFormat::Json => output.json(&json!({"id": id.to_bs58check()})),
        _ => println!("{}", id),
    }
    Ok(())
}

/// Set a key, then try to deliver the change before exiting
pub async fn put(
    engine: &Engine,
    document: &str,
    key: &str,
    value: &str,
    output: &Output,
) -> Result<()> {
    let document_id = parse_document_id(document)?;
    let coordinator = engine.coordinator(document_id, output).await?;

    coordinator
        .change(|doc| doc.put(key, value))
        .await
        .context("Failed to save change")?;
    output.success(&format!("Set {} = {}", key, value));

    finish(engine, &coordinator, output).await
}

/// Remove a key
pub async fn delete(engine: &Engine, document: &str, key: &str, output: &Output) -> Result<()> {
    let document_id = parse_document_id(document)?;
    let coordinator = engine.coordinator(document_id, output).await?;

    coordinator
        .change(|doc| doc.delete(key))
        .await
        .context("Failed to save change")?;
    output.success(&format!("Deleted {}", key));

    finish(engine, &coordinator, output).await
}

/// Read one key, or the whole document
pub async fn get(engine: &Engine, document: &str, key: Option<&str>, output: &Output) -> Result<()> {
    let document_id = parse_document_id(document)?;
    let coordinator = engine.coordinator(document_id, output).await?;

    let entries = {
        let doc = coordinator.document();
        let doc = doc.lock().await;
        match key {
            Some(key) => doc
                .get(key)?
                .map(|value| vec![(key.to_string(), value)])
                .unwrap_or_default(),
            None => doc.entries()?,
        }
    };
    coordinator.disconnect().await?;

    if let (Some(key), true) = (key, entries.is_empty()) {
        anyhow::bail!("Key '{}' not found in {}", key, document_id);
    }
    output.print_entries(&entries);
    Ok(())
}

/// Flush pending pushes and close the session
async fn finish(engine: &Engine, coordinator: &Coordinator, output: &Output) -> Result<()> {
    match coordinator.force_sync().await {
        Ok(()) => {}
        Err(e) if e.is_network() => output.warn(&format!("Push failed: {}", e)),
        Err(e) => return Err(e.into()),
    }

    if engine.config.active_relay().is_some() && coordinator.has_unpushed_ops()? {
        output.warn("Changes are saved locally but have not reached the relay yet.");
    }
    coordinator.disconnect().await?;
    Ok(())
}
