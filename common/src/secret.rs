//! Shared-secret generation, persistence and destruction.
//!
//! The helper generates one secret per process start and persists it where
//! only the launching user can read it; the client loads it at connect time.
//! The in-memory copy is wiped when the last reference drops, and the file
//! is overwritten and deleted on helper shutdown.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Fixed length of the shared symmetric secret.
pub const SECRET_LEN: usize = 32;

const SECRET_FILE_NAME: &str = "helper.secret";

/// The shared symmetric key. Never logged; zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SECRET_LEN]);

impl SharedSecret {
    /// Generates a fresh secret from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps raw bytes, rejecting anything but the exact expected length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SECRET_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("secret must be exactly {SECRET_LEN} bytes"))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short digest-of-the-key identifier for logs, so two processes can be
    /// checked for agreement without the key itself ever appearing.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Location of the persisted secret plus the operations on it.
#[derive(Debug, Clone)]
pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    /// The per-user application-data location clients discover the secret at.
    pub fn default_location() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "netsight")
            .ok_or_else(|| anyhow!("no home directory available for the secret store"))?;
        Ok(Self {
            path: dirs.data_local_dir().join(SECRET_FILE_NAME),
        })
    }

    /// A store at an explicit path. Used by tests and non-default deployments.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the secret with access restricted to the current user. The
    /// parent directory is created as needed.
    pub fn persist(&self, secret: &SharedSecret) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create secret directory {parent:?}"))?;
        }

        let mut file = open_owner_only(&self.path)
            .with_context(|| format!("failed to create secret file {:?}", self.path))?;
        file.write_all(secret.as_bytes())
            .context("failed to write secret")?;
        file.sync_all().context("failed to sync secret file")?;

        tracing::debug!(path = ?self.path, "shared secret persisted");
        Ok(())
    }

    /// Loads the secret, failing closed when it is missing or malformed.
    pub fn load(&self) -> Result<SharedSecret> {
        let mut bytes = fs::read(&self.path)
            .with_context(|| format!("failed to read secret file {:?}", self.path))?;
        let secret = SharedSecret::from_bytes(&bytes);
        bytes.zeroize();
        secret
    }

    /// Overwrites the secret file with zeros and removes it. Idempotent:
    /// a store whose file is already gone reports success.
    pub fn destroy(&self) -> Result<()> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("failed to stat secret file"),
        };

        // Best-effort scrub before unlinking.
        if let Ok(mut file) = fs::OpenOptions::new().write(true).open(&self.path) {
            let _ = file.write_all(&vec![0u8; len]);
            let _ = file.sync_all();
        }

        fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove secret file {:?}", self.path))?;
        tracing::debug!(path = ?self.path, "shared secret destroyed");
        Ok(())
    }
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(windows)]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    // The per-user application-data directory already carries an ACL limited
    // to the owning user and SYSTEM; the file inherits it.
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
