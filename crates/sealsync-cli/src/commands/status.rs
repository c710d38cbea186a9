//! Status command handler

use anyhow::Result;
use serde_json::{json, Value};

use sealsync_core::storage::meta::keys;
use sealsync_core::{DocumentId, LocalStore};

use crate::engine::Engine;
use crate::output::{Output, OutputFormat};

/// Local state of one document
struct DocumentStatus {
    id: DocumentId,
    unpushed: u64,
    pending_ops: u64,
    pending_bytes: u64,
    snapshot_size: Option<usize>,
    snapshot_version: Option<String>,
    synced: bool,
}

impl DocumentStatus {
    fn load(store: &LocalStore, id: DocumentId) -> Result<Self> {
        let stats = store.count_ops_since_snapshot(&id)?;
        let snapshot = store.load_snapshot(&id)?;
        Ok(Self {
            id,
            unpushed: store.unpushed_count(&id)?,
            pending_ops: stats.count,
            pending_bytes: stats.bytes,
            snapshot_size: snapshot.map(|s| s.ciphertext.len()),
            snapshot_version: store.get_meta(&id, keys::SNAPSHOT_VERSION)?,
            synced: store.get_meta(&id, keys::LAST_SYNCED_VERSION)?.is_some(),
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id.to_bs58check(),
            "unpushed": self.unpushed,
            "ops_since_snapshot": self.pending_ops,
            "bytes_since_snapshot": self.pending_bytes,
            "snapshot_size": self.snapshot_size,
            "snapshot_version": self.snapshot_version,
            "synced": self.synced,
        })
    }
}

/// Show status information
pub fn show(engine: &Engine, output: &Output) -> Result<()> {
    let config = &engine.config;
    let documents = engine
        .store()
        .document_ids()?
        .into_iter()
        .map(|id| DocumentStatus::load(engine.store(), id))
        .collect::<Result<Vec<_>>>()?;

    match output.format {
        OutputFormat::Json => {
            output.json(&json!({
                "author_id": engine.author_id(),
                "sync_enabled": config.sync_enabled,
                "relay_url": config.relay_url,
                "database": config.database_path(),
                "documents": documents.iter().map(DocumentStatus::to_json).collect::<Vec<_>>(),
            }));
        }
        OutputFormat::Quiet => {
            for doc in &documents {
                println!("{} {}", doc.id, doc.unpushed);
            }
        }
        OutputFormat::Human => {
            println!("sealsync Status");
            println!("===============");
            println!();
            println!("Author: {}", engine.author_id());
            println!();
            println!("Sync:");
            println!(
                "  Status: {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.relay_url {
                println!("  Relay:  {}", url);
            }
            println!();
            println!("Storage:");
            println!("  Database: {}", config.database_path().display());
            println!();

            if documents.is_empty() {
                println!("No documents yet.");
                return Ok(());
            }
            println!("Documents:");
            for doc in &documents {
                println!("  {}", doc.id);
                println!("    Unpushed ops:        {}", doc.unpushed);
                println!(
                    "    Since snapshot:      {} op(s), {} bytes",
                    doc.pending_ops, doc.pending_bytes
                );
                match doc.snapshot_size {
                    Some(size) => println!(
                        "    Snapshot:            {} bytes (version {})",
                        size,
                        doc.snapshot_version.as_deref().unwrap_or("0")
                    ),
                    None => println!("    Snapshot:            none"),
                }
                println!(
                    "    Synced:              {}",
                    if doc.synced { "yes" } else { "never" }
                );
            }
        }
    }

    Ok(())
}
