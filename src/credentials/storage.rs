//! Single-document credential storage.
//!
//! The document is read fully into memory when the store is opened and
//! rewritten fully on every mutation (temp file + rename). When an encryption
//! key is configured the document is sealed with AES-256-GCM.

use super::{encryption, ClientCredentials, CredentialRecord};
use crate::lock;
use crate::oauth::Provider;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DOCUMENT_VERSION: u32 = 1;

fn document_version() -> u32 {
    DOCUMENT_VERSION
}

/// On-disk layout.
///
/// ```json
/// {
///   "version": 1,
///   "credentials": { "kick": { "access_token": "...", ... }, "spotify": { ... } },
///   "clients": { "kick": { "client_id": "...", "client_secret": "..." } }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default = "document_version")]
    version: u32,
    #[serde(default)]
    credentials: BTreeMap<Provider, CredentialRecord>,
    #[serde(default)]
    clients: BTreeMap<Provider, ClientCredentials>,
}

/// Process-wide credential store.
///
/// # Thread Safety
/// - The in-memory document sits behind a Mutex; every mutation persists while
///   holding it, so writers never interleave.
/// - A mutation is committed to memory only after it reached disk.
pub struct CredentialStore {
    path: Option<PathBuf>,
    encryption_key: Option<Vec<u8>>,
    document: Mutex<StoreDocument>,
}

impl CredentialStore {
    /// Opens (or lazily creates) the store at `path`.
    ///
    /// # Arguments
    /// * `path` - JSON document location; created on first write
    /// * `encryption_key` - Optional base64-encoded 32-byte key
    pub fn open<P: AsRef<Path>>(path: P, encryption_key: Option<&str>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let encryption_key = encryption_key
            .map(encryption::validate_key)
            .transpose()
            .context("Invalid encryption key")?;

        let mut document = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read credential store {}", path.display()))?;
            parse_document(&contents, encryption_key.as_deref())
                .with_context(|| format!("Failed to load credential store {}", path.display()))?
        } else {
            StoreDocument::default()
        };

        for record in document.credentials.values_mut() {
            record.normalize();
        }

        Ok(Self {
            path: Some(path),
            encryption_key,
            document: Mutex::new(document),
        })
    }

    /// Store that never touches disk (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            encryption_key: None,
            document: Mutex::new(StoreDocument::default()),
        }
    }

    /// Snapshot of a provider's record (empty if never written).
    pub fn record(&self, provider: Provider) -> CredentialRecord {
        lock(&self.document)
            .credentials
            .get(&provider)
            .cloned()
            .unwrap_or_default()
    }

    /// Mutates a provider's record and persists the whole document.
    ///
    /// Returns the record as written.
    pub fn update<F>(&self, provider: Provider, mutate: F) -> Result<CredentialRecord>
    where
        F: FnOnce(&mut CredentialRecord),
    {
        let mut document = lock(&self.document);
        let mut next = document.clone();
        let record = next.credentials.entry(provider).or_default();
        mutate(record);
        let written = record.clone();
        if written.is_empty() {
            next.credentials.remove(&provider);
        }

        self.persist(&next)?;
        *document = next;
        Ok(written)
    }

    /// Resets every field of a provider's record, cached identity included.
    pub fn clear(&self, provider: Provider) -> Result<()> {
        self.update(provider, |record| *record = CredentialRecord::default())
            .map(|_| ())
    }

    /// Removes and returns the outstanding PKCE verifier.
    pub fn take_code_verifier(&self, provider: Provider) -> Result<Option<String>> {
        let mut taken = None;
        self.update(provider, |record| taken = record.code_verifier.take())?;
        Ok(taken)
    }

    pub fn client(&self, provider: Provider) -> Option<ClientCredentials> {
        lock(&self.document).clients.get(&provider).cloned()
    }

    /// Stores client credentials. User tokens are left as they are.
    pub fn set_client(&self, provider: Provider, credentials: ClientCredentials) -> Result<()> {
        let mut document = lock(&self.document);
        let mut next = document.clone();
        next.clients.insert(provider, credentials);
        self.persist(&next)?;
        *document = next;
        Ok(())
    }

    /// Deletes client credentials without touching user tokens.
    ///
    /// # Returns
    /// * `Ok(true)` - Credentials removed
    /// * `Ok(false)` - None were stored
    pub fn remove_client(&self, provider: Provider) -> Result<bool> {
        let mut document = lock(&self.document);
        if !document.clients.contains_key(&provider) {
            return Ok(false);
        }
        let mut next = document.clone();
        next.clients.remove(&provider);
        self.persist(&next)?;
        *document = next;
        Ok(true)
    }

    fn persist(&self, document: &StoreDocument) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let plain = serde_json::to_string_pretty(document)
            .context("Failed to serialize credential store")?;
        let contents = match &self.encryption_key {
            Some(key) => {
                let sealed = encryption::encrypt(&plain, key)
                    .context("Failed to encrypt credential store")?;
                serde_json::to_string_pretty(&sealed)
                    .context("Failed to serialize sealed credential store")?
            }
            None => plain,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, contents)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        restrict_permissions(&tmp_path)?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        Ok(())
    }
}

fn parse_document(contents: &str, key: Option<&[u8]>) -> Result<StoreDocument> {
    if contents.trim().is_empty() {
        return Ok(StoreDocument::default());
    }

    let value: serde_json::Value =
        serde_json::from_str(contents).context("Credential store is not valid JSON")?;
    let is_sealed = value.get("ciphertext").is_some() && value.get("nonce").is_some();

    let document = match (is_sealed, key) {
        (true, Some(key)) => {
            let sealed: encryption::SealedDocument = serde_json::from_value(value)?;
            let plain = encryption::decrypt(&sealed, key)?;
            serde_json::from_str(&plain).context("Decrypted credential store is malformed")?
        }
        (true, None) => {
            return Err(anyhow!(
                "Credential store is encrypted but no encryption key is configured"
            ))
        }
        // Plain documents are accepted even with a key; the next write seals them
        (false, _) => serde_json::from_value(value).context("Credential store is malformed")?,
    };

    Ok(document)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
