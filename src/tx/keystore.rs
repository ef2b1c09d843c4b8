//! Keystore adapter mapping bech32 chain addresses to signing keys

use async_trait::async_trait;
use bech32::ToBase32;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{RelayerError, RelayerResult};

const SIGNATURE_LENGTH: usize = 64;

/// External key storage. Accounts are identified by their hex encoded
/// compressed secp256k1 public key.
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn accounts(&self) -> RelayerResult<Vec<String>>;

    async fn sign(&self, account: &str, data: &[u8]) -> RelayerResult<Vec<u8>>;
}

/// Bech32 address of a public key: ripemd160(sha256(pubkey))
pub fn pub_to_addr(pub_key: &[u8], prefix: &str) -> RelayerResult<String> {
    let sha_hash = Sha256::digest(pub_key);
    let rip_hash = Ripemd160::digest(sha_hash);

    bech32::encode(prefix, rip_hash.to_base32(), bech32::Variant::Bech32)
        .map_err(|e| RelayerError::Keystore(format!("bech32 encoding failed: {}", e)))
}

/// Resolves chain addresses to keystore accounts, refreshing the mapping
/// lazily when an unknown address is requested.
pub struct KeystoreAdapter {
    keystore: Arc<dyn Keystore>,
    prefix: String,
    /// address -> public key
    address_map: Mutex<HashMap<String, Vec<u8>>>,
}

impl KeystoreAdapter {
    pub fn new(keystore: Arc<dyn Keystore>, prefix: impl Into<String>) -> Self {
        Self {
            keystore,
            prefix: prefix.into(),
            address_map: Mutex::new(HashMap::new()),
        }
    }

    async fn refresh(&self, address_map: &mut HashMap<String, Vec<u8>>) -> RelayerResult<()> {
        let accounts = self.keystore.accounts().await?;

        let mut fresh = HashMap::with_capacity(accounts.len());
        for account in accounts {
            let pub_key = hex::decode(&account).map_err(|e| {
                RelayerError::Keystore(format!("invalid public key {}: {}", account, e))
            })?;
            let address = pub_to_addr(&pub_key, &self.prefix)?;
            fresh.insert(address, pub_key);
        }

        debug!("Keystore adapter mapped {} accounts", fresh.len());
        *address_map = fresh;
        Ok(())
    }

    /// Addresses of all keystore accounts
    pub async fn accounts(&self) -> RelayerResult<Vec<String>> {
        let mut address_map = self.address_map.lock().await;
        self.refresh(&mut address_map).await?;

        let mut addresses: Vec<String> = address_map.keys().cloned().collect();
        addresses.sort();
        Ok(addresses)
    }

    /// Public key of an address, refreshing once on a miss
    pub async fn pub_key(&self, address: &str) -> RelayerResult<Vec<u8>> {
        let mut address_map = self.address_map.lock().await;
        if let Some(pub_key) = address_map.get(address) {
            return Ok(pub_key.clone());
        }

        self.refresh(&mut address_map).await?;
        address_map
            .get(address)
            .cloned()
            .ok_or_else(|| RelayerError::Keystore(format!("account not found: {}", address)))
    }

    /// Sign `data` with the key behind `address`
    pub async fn sign(&self, address: &str, data: &[u8]) -> RelayerResult<Vec<u8>> {
        let pub_key = self.pub_key(address).await?;
        let signature = self.keystore.sign(&hex::encode(&pub_key), data).await?;

        if signature.len() != SIGNATURE_LENGTH {
            return Err(RelayerError::Keystore(format!(
                "invalid signature length: expected {} got {}",
                SIGNATURE_LENGTH,
                signature.len()
            )));
        }
        Ok(signature)
    }

    /// Signer bound to one address
    pub async fn signer(self: &Arc<Self>, address: &str) -> RelayerResult<AccountSigner> {
        let pub_key = self.pub_key(address).await?;
        Ok(AccountSigner {
            address: address.to_string(),
            pub_key,
            adapter: self.clone(),
        })
    }
}

/// Signing handle for a single account, passed to the chain client
#[derive(Clone)]
pub struct AccountSigner {
    address: String,
    pub_key: Vec<u8>,
    adapter: Arc<KeystoreAdapter>,
}

impl AccountSigner {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }

    /// Sign the sha256 digest of the sign bytes
    pub async fn sign(&self, sign_bytes: &[u8]) -> RelayerResult<Vec<u8>> {
        let digest = Sha256::digest(sign_bytes);
        self.adapter.sign(&self.address, &digest).await
    }
}

impl std::fmt::Debug for AccountSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSigner")
            .field("address", &self.address)
            .field("pub_key", &hex::encode(&self.pub_key))
            .finish()
    }
}

impl PartialEq for AccountSigner {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.pub_key == other.pub_key
    }
}
