//! File-backed identity store
//!
//! The static key lives in the data directory as two hex files with owner
//! only permissions. `panic_clear` removes them.

use std::path::PathBuf;

use bitchat_core::identity::IdentityStore;
use bitchat_core::{BitchatError, Result};

/// Identity persistence under the node's data directory
pub struct FileIdentityStore {
    private_path: PathBuf,
    public_path: PathBuf,
}

impl FileIdentityStore {
    /// Create a store rooted at `data_dir`
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            private_path: data_dir.join("identity.key"),
            public_path: data_dir.join("identity.pub"),
        }
    }

    fn read_key(path: &PathBuf) -> Result<Option<[u8; 32]>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(err)),
        };
        let bytes = hex::decode(raw.trim())
            .map_err(|_| BitchatError::config("identity file is not valid hex"))?;
        if bytes.len() != 32 {
            return Err(BitchatError::config("identity key must be 32 bytes"));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<([u8; 32], [u8; 32])>> {
        let private_key = Self::read_key(&self.private_path)?;
        let public_key = Self::read_key(&self.public_path)?;
        match (private_key, public_key) {
            (Some(private_key), Some(public_key)) => Ok(Some((private_key, public_key))),
            _ => Ok(None),
        }
    }

    fn save(&self, private_key: &[u8; 32], public_key: &[u8; 32]) -> Result<()> {
        if let Some(parent) = self.private_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        std::fs::write(&self.private_path, hex::encode(private_key)).map_err(io_error)?;
        std::fs::write(&self.public_path, hex::encode(public_key)).map_err(io_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.private_path, permissions).map_err(io_error)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        for path in [&self.private_path, &self.public_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(err)),
            }
        }
        Ok(())
    }
}

fn io_error(err: std::io::Error) -> BitchatError {
    BitchatError::Transport(bitchat_core::TransportError::Io(err))
}
