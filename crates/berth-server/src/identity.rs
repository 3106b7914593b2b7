//! RSA identity of the server.
//!
//! The key pair authenticates the server to clients and protects the initial
//! handshake. Keys are stored as PEM: SPKI for the public half and PKCS#8 for
//! the private half. The fingerprint is the SHA-256 of the public PEM and is
//! only meant for operators to compare out of band.

use std::io::Write;
use std::path::Path;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::IdentityError;

pub const DEFAULT_KEY_SIZE: usize = 4096;
pub const MIN_KEY_SIZE: usize = 1024;
pub const MAX_KEY_SIZE: usize = 4096;

/// An RSA key pair with its PEM encodings.
pub struct Identity {
    public_pem: String,
    private_pem: Zeroizing<String>,
    key_size: usize,
}

impl Identity {
    /// Generate a fresh key pair. Nothing is written to disk.
    pub fn generate(key_size: usize) -> Result<Self, IdentityError> {
        if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&key_size) || key_size % 8 != 0 {
            return Err(IdentityError::UnsupportedKeySize {
                bits: key_size,
                min: MIN_KEY_SIZE,
                max: MAX_KEY_SIZE,
            });
        }
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), key_size)
            .map_err(|e| IdentityError::Crypto(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, IdentityError> {
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| IdentityError::Crypto(e.to_string()))?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::Crypto(e.to_string()))?;
        let key_size = rsa::traits::PublicKeyParts::size(&private_key) * 8;
        Ok(Self {
            public_pem,
            private_pem,
            key_size,
        })
    }

    /// Load a previously persisted identity. The public file must belong to
    /// the private key.
    pub fn load(public_path: &Path, private_path: &Path) -> Result<Self, IdentityError> {
        let private_pem = Zeroizing::new(
            std::fs::read_to_string(private_path).map_err(|e| IdentityError::io(private_path, e))?,
        );
        let private_key = RsaPrivateKey::from_pkcs8_pem(&private_pem)
            .map_err(|e| IdentityError::Crypto(e.to_string()))?;

        let public_pem =
            std::fs::read_to_string(public_path).map_err(|e| IdentityError::io(public_path, e))?;
        let public_key = RsaPublicKey::from_public_key_pem(&public_pem)
            .map_err(|e| IdentityError::Crypto(e.to_string()))?;
        if public_key != RsaPublicKey::from(&private_key) {
            return Err(IdentityError::Crypto(format!(
                "{} does not match {}",
                public_path.display(),
                private_path.display()
            )));
        }

        Self::from_private_key(private_key)
    }

    /// Load the identity at the given paths, or generate and persist one of
    /// `key_size` bits if the private key file does not exist yet.
    pub fn load_or_generate(
        public_path: &Path,
        private_path: &Path,
        key_size: usize,
    ) -> Result<Self, IdentityError> {
        if private_path.exists() {
            return Self::load(public_path, private_path);
        }
        info!(key_size, "no server identity found, generating one");
        let identity = Self::generate(key_size)?;
        identity.persist(public_path, private_path)?;
        Ok(identity)
    }

    /// Write both keys, replacing whatever is at those paths. Both files are
    /// staged next to their targets before either is renamed into place.
    pub fn persist(&self, public_path: &Path, private_path: &Path) -> Result<(), IdentityError> {
        let private_tmp = stage(private_path, self.private_pem.as_bytes(), 0o600)?;
        let public_tmp = stage(public_path, self.public_pem.as_bytes(), 0o644)?;

        private_tmp
            .persist(private_path)
            .map_err(|e| IdentityError::io(private_path, e.error))?;
        public_tmp
            .persist(public_path)
            .map_err(|e| IdentityError::io(public_path, e.error))?;

        info!(
            public = %public_path.display(),
            private = %private_path.display(),
            fingerprint = %self.fingerprint(),
            "server identity written"
        );
        Ok(())
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.public_pem.as_bytes())
    }
}

/// SHA-256 of an encoded public key, as lowercase hex.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

fn stage(target: &Path, contents: &[u8], mode: u32) -> Result<NamedTempFile, IdentityError> {
    let dir = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| IdentityError::io(dir, e))?;

    let mut file = NamedTempFile::new_in(dir).map_err(|e| IdentityError::io(dir, e))?;
    file.write_all(contents)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| IdentityError::io(target, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(mode))
            .map_err(|e| IdentityError::io(target, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(file)
}
