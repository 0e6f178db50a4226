use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer};
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};

/// A 20-byte account or contract address, rendered as `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Last 20 bytes of the SHA-256 digest of the public key.
    pub fn from_public_key(public: &[u8]) -> Self {
        let digest = Sha256::digest(public);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Address(out)
    }

    /// Address of a contract created by `sender` with `nonce`.
    pub fn for_contract(sender: &Address, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(sender.0);
        hasher.update(nonce.to_be_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Address(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = strip_hex_prefix(s.trim());
        let bytes = hex::decode(raw)
            .map_err(|e| LedgerError::Codec(format!("invalid address {}: {}", s, e)))?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|v: Vec<u8>| {
            LedgerError::Codec(format!("invalid address {}: {} bytes, expected 20", s, v.len()))
        })?;
        Ok(Address(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

pub(crate) fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// An identity able to authorize transactions.
///
/// The nonce is deliberately not stored here: it lives in the ledger and in
/// the caller-owned [`Sequencer`](crate::sequencer::Sequencer).
pub struct Account {
    keypair: Keypair,
    address: Address,
}

impl Account {
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let secret =
            SecretKey::from_bytes(secret).map_err(|e| LedgerError::Key(e.to_string()))?;
        let public = PublicKey::from(&secret);
        let address = Address::from_public_key(public.as_bytes());
        Ok(Self {
            keypair: Keypair { secret, public },
            address,
        })
    }

    /// Parse a hex encoded 32-byte secret key, with or without `0x`.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(strip_hex_prefix(secret_hex.trim()))
            .map_err(|e| LedgerError::Key(format!("secret key is not hex: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Load the secret key from the environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        let value = std::env::var(var)
            .map_err(|_| LedgerError::Key(format!("environment variable {} is not set", var)))?;
        Self::from_secret_hex(&value)
    }

    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        // 32 bytes always form a valid ed25519 secret key
        match Self::from_secret_bytes(&secret) {
            Ok(account) => account,
            Err(e) => unreachable!("ed25519 secret key from 32 bytes: {}", e),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret.as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
