// Identity session for walletchat
// Wraps whatever wallet the user authenticated with: a stable account id
// plus the ability to sign payloads with that account's key.

use async_trait::async_trait;
use log::info;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::models::AccountIdentifier;

pub mod local_wallet;

pub use local_wallet::{LocalSigner, LocalWallet};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// No wallet is available to authenticate with
    #[error("No wallet provider available")]
    NoProvider,

    /// The wallet exposes no accounts
    #[error("Wallet has no accounts")]
    NoAccounts,

    /// The user declined the connection request
    #[error("User rejected the wallet request")]
    UserRejected,

    /// Key material could not be read or used
    #[error("Key error: {0}")]
    Key(String),
}

/// Signing capability handed out by a wallet
pub trait MessageSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, IdentityError>;

    /// Hex encoded public key, if the signer exposes one
    fn public_key_hex(&self) -> Option<String> {
        None
    }
}

/// Something that can authenticate a user and produce an [`IdentitySession`]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self) -> Result<IdentitySession, IdentityError>;
}

/// Authenticated user. Immutable once created; dropped or [`end`](Self::end)ed on logout.
#[derive(Clone)]
pub struct IdentitySession {
    account: AccountIdentifier,
    signer: Arc<dyn MessageSigner>,
}

impl IdentitySession {
    pub fn new(account: AccountIdentifier, signer: Arc<dyn MessageSigner>) -> Self {
        info!("Identity session started for {}", account);
        IdentitySession { account, signer }
    }

    pub fn account(&self) -> &AccountIdentifier {
        &self.account
    }

    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, IdentityError> {
        self.signer.sign(payload)
    }

    pub fn public_key_hex(&self) -> Option<String> {
        self.signer.public_key_hex()
    }

    pub fn end(self) {
        info!("Identity session ended for {}", self.account);
    }
}

impl fmt::Debug for IdentitySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentitySession")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Provider with a predetermined outcome. Useful for tests and for callers
/// that obtained the account out of band.
pub struct FixedAccountProvider {
    outcome: Result<AccountIdentifier, IdentityError>,
}

impl FixedAccountProvider {
    pub fn new(account: &str) -> Self {
        FixedAccountProvider { outcome: Ok(AccountIdentifier::new(account)) }
    }

    pub fn failing(error: IdentityError) -> Self {
        FixedAccountProvider { outcome: Err(error) }
    }
}

#[async_trait]
impl IdentityProvider for FixedAccountProvider {
    async fn authenticate(&self) -> Result<IdentitySession, IdentityError> {
        let account = self.outcome.clone()?;
        Ok(IdentitySession::new(account, Arc::new(LocalSigner::ephemeral())))
    }
}
