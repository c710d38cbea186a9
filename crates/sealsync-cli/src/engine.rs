//! Engine setup shared by commands
//!
//! Opens the local store, loads the key file, and builds a coordinator for a
//! document, attaching the relay when one is configured and reachable.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use sealsync_core::{
    AesGcmCipher, AutomergeDocument, Config, DocumentId, EncryptionKey, LocalStore,
    PayloadCipher, RemoteChannel, SyncCoordinator, WsRemoteChannel,
};

use crate::output::Output;

/// Coordinator over the bundled automerge document
pub type Coordinator = SyncCoordinator<AutomergeDocument>;

/// Everything a command needs to talk to local state
pub struct Engine {
    pub config: Config,
    store: LocalStore,
    cipher: Arc<dyn PayloadCipher>,
    author_id: String,
}

impl Engine {
    /// Open the store and key named by `config`
    ///
    /// Fails with a hint when `sealsync init` has not been run.
    pub fn open(config: Config) -> Result<Self> {
        let Some(author_id) = config.author_id.clone() else {
            bail!("Not initialized. Run `sealsync init` first.");
        };

        let key = load_key(&config.key_path())?;
        let store = LocalStore::open(&config.database_path())
            .with_context(|| format!("Failed to open {:?}", config.database_path()))?;

        Ok(Self {
            config,
            store,
            cipher: Arc::new(AesGcmCipher::new(&key)),
            author_id,
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// Build and initialize a coordinator for `document_id`
    ///
    /// The relay is used when sync is enabled. If it cannot be reached the
    /// coordinator runs local-only and a warning is printed.
    pub async fn coordinator(&self, document_id: DocumentId, output: &Output) -> Result<Coordinator> {
        let remote = match self.config.active_relay() {
            Some(url) => match WsRemoteChannel::connect(url, self.author_id.clone()).await {
                Ok(channel) => Some(Arc::new(channel) as Arc<dyn RemoteChannel>),
                Err(e) => {
                    warn!("Relay {} unreachable: {}", url, e);
                    output.warn(&format!("Relay unreachable ({}), working offline", e));
                    None
                }
            },
            None => None,
        };
        let online = remote.is_some();

        let coordinator = self.build(document_id, remote);
        match coordinator.initialize().await {
            Ok(()) => Ok(coordinator),
            Err(e) if e.is_network() && online => {
                output.warn(&format!("Bootstrap failed ({}), working offline", e));
                drop(coordinator);
                let local = self.build(document_id, None);
                local.initialize().await.context("Failed to open document")?;
                Ok(local)
            }
            Err(e) => Err(e).context("Failed to open document"),
        }
    }

    fn build(&self, document_id: DocumentId, remote: Option<Arc<dyn RemoteChannel>>) -> Coordinator {
        debug!(
            "Building coordinator for {} (remote: {})",
            document_id,
            remote.is_some()
        );
        let builder = SyncCoordinator::builder(
            document_id,
            AutomergeDocument::new(),
            self.store.clone(),
            self.cipher.clone(),
            self.author_id.clone(),
        );
        match remote {
            Some(remote) => builder.with_remote(remote).build(),
            None => builder.build(),
        }
    }
}

/// Read a base64 key file
pub fn load_key(path: &Path) -> Result<EncryptionKey> {
    let encoded = fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read key file {:?}. Run `sealsync init` first.",
            path
        )
    })?;
    EncryptionKey::from_base64(&encoded).with_context(|| format!("Invalid key file {:?}", path))
}

/// Write a key file readable only by the owner
pub fn write_key(path: &Path, key: &EncryptionKey) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create key file {:?}", path))?;
    std::io::Write::write_all(&mut file, key.to_base64().as_bytes())
        .with_context(|| format!("Failed to write key file {:?}", path))?;
    Ok(())
}

/// Parse a document id argument
pub fn parse_document_id(text: &str) -> Result<DocumentId> {
    DocumentId::from_bs58check(text.trim())
        .map_err(|e| anyhow::anyhow!("Invalid document ID '{}': {}", text, e))
}
