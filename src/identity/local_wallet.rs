// Local development wallet
// Keeps an ed25519 key on disk and derives a 0x-prefixed 20 byte address from it

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey, Signature};
use log::{debug, info, warn};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

use super::{IdentityError, IdentityProvider, IdentitySession, MessageSigner};
use crate::models::AccountIdentifier;

const KEY_FILE_NAME: &str = "wallet.key";

pub struct LocalSigner {
    signing_key: SigningKey,
}

impl LocalSigner {
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        LocalSigner { signing_key: SigningKey::from_bytes(secret) }
    }

    /// Throwaway key, never written to disk
    pub fn ephemeral() -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut secret[..]);
        Self::from_secret(&secret)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Address is the last 20 bytes of SHA-256 over the public key
    pub fn address(&self) -> String {
        let digest = Sha256::digest(self.verifying_key().as_bytes());
        format!("0x{}", hex::encode(&digest[digest.len() - 20..]))
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.verifying_key().verify(payload, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl MessageSigner for LocalSigner {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, IdentityError> {
        Ok(self.signing_key.sign(payload).to_bytes().to_vec())
    }

    fn public_key_hex(&self) -> Option<String> {
        Some(hex::encode(self.verifying_key().as_bytes()))
    }
}

/// Wallet provider backed by a key file in `key_dir`
pub struct LocalWallet {
    key_dir: Option<PathBuf>,
    create_if_missing: bool,
    approve: bool,
}

impl LocalWallet {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        LocalWallet {
            key_dir: Some(key_dir.into()),
            create_if_missing: true,
            approve: true,
        }
    }

    /// A wallet that is not installed at all
    pub fn unavailable() -> Self {
        LocalWallet { key_dir: None, create_if_missing: false, approve: true }
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Simulates the user approving or declining the connection prompt
    pub fn approve(mut self, approve: bool) -> Self {
        self.approve = approve;
        self
    }

    fn load_signer(&self, key_dir: &Path) -> Result<LocalSigner, IdentityError> {
        let key_path = key_dir.join(KEY_FILE_NAME);
        if key_path.exists() {
            debug!("Loading wallet key from {}", key_path.display());
            let stored = Zeroizing::new(
                fs::read_to_string(&key_path)
                    .map_err(|e| IdentityError::Key(format!("read {}: {}", key_path.display(), e)))?,
            );
            let bytes = Zeroizing::new(
                hex::decode(stored.trim()).map_err(|e| IdentityError::Key(format!("decode key hex: {}", e)))?,
            );
            let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| IdentityError::Key(format!("expected 32 key bytes, got {}", bytes.len())))?,
            );
            return Ok(LocalSigner::from_secret(&secret));
        }

        if !self.create_if_missing {
            warn!("No wallet key at {}", key_path.display());
            return Err(IdentityError::NoAccounts);
        }

        let mut secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut secret[..]);
        let encoded = Zeroizing::new(hex::encode(&secret[..]));
        fs::write(&key_path, encoded.as_bytes())
            .map_err(|e| IdentityError::Key(format!("write {}: {}", key_path.display(), e)))?;
        info!("Created new wallet key at {}", key_path.display());
        Ok(LocalSigner::from_secret(&secret))
    }
}

#[async_trait]
impl IdentityProvider for LocalWallet {
    async fn authenticate(&self) -> Result<IdentitySession, IdentityError> {
        let key_dir = match &self.key_dir {
            Some(dir) if dir.is_dir() => dir,
            _ => return Err(IdentityError::NoProvider),
        };
        if !self.approve {
            return Err(IdentityError::UserRejected);
        }
        let signer = self.load_signer(key_dir)?;
        let account = AccountIdentifier::new(signer.address());

        // Sign-in challenge: the stored key must produce signatures it can verify
        let challenge = format!("walletchat sign-in {}", account);
        let signature = signer.sign(challenge.as_bytes())?;
        if !signer.verify(challenge.as_bytes(), &signature) {
            return Err(IdentityError::Key("wallet key failed its sign-in challenge".to_string()));
        }
        Ok(IdentitySession::new(account, Arc::new(signer)))
    }
}
