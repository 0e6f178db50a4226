use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{PublicKey, Signature, Verifier};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::account::{strip_hex_prefix, Account, Address};
use crate::error::{LedgerError, Result};

/// Gas limit of a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

/// Content hash of a signed transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        TxHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for TxHash {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(strip_hex_prefix(s.trim()))
            .map_err(|e| LedgerError::Codec(format!("invalid tx hash {}: {}", s, e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LedgerError::Codec(format!("invalid tx hash {}: expected 32 bytes", s)))?;
        Ok(TxHash(bytes))
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// What a caller wants done, before it is bound to a sender and a nonce.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    /// `None` deploys `data` as contract code.
    pub to: Option<Address>,
    pub value: u128,
    pub gas_limit: u64,
    pub data: Vec<u8>,
}

impl TxRequest {
    pub fn transfer(to: Address, value: u128) -> Self {
        Self {
            to: Some(to),
            value,
            gas_limit: TRANSFER_GAS,
            data: Vec::new(),
        }
    }

    pub fn deploy(code: impl Into<Vec<u8>>, gas_limit: u64) -> Self {
        Self {
            to: None,
            value: 0,
            gas_limit,
            data: code.into(),
        }
    }

    pub fn call(contract: Address, data: Vec<u8>, gas_limit: u64) -> Self {
        Self {
            to: Some(contract),
            value: 0,
            gas_limit,
            data,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn kind(&self) -> TxKind {
        match (&self.to, self.data.is_empty()) {
            (None, _) => TxKind::Deploy,
            (Some(_), true) => TxKind::Transfer,
            (Some(_), false) => TxKind::Call,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Deploy,
    Call,
    Transfer,
}

/// A state change bound to its sender, nonce and fee parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub from: Address,
    /// Count of transactions the sender submitted before this one.
    pub nonce: u64,
    pub fee_price: u128,
    pub request: TxRequest,
}

#[derive(Serialize)]
struct SigningPayload<'a> {
    chain_id: u64,
    tx: &'a Transaction,
}

impl Transaction {
    pub fn new(from: Address, nonce: u64, fee_price: u128, request: TxRequest) -> Self {
        Self {
            from,
            nonce,
            fee_price,
            request,
        }
    }

    /// Highest fee this transaction can be charged.
    pub fn max_fee(&self) -> u128 {
        self.fee_price.saturating_mul(self.request.gas_limit as u128)
    }

    /// Bytes covered by the signature. Binding the chain id keeps a
    /// signature from being replayed on another network.
    pub fn signing_bytes(&self, chain_id: u64) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&SigningPayload { chain_id, tx: self })?)
    }

    pub fn sign(self, chain_id: u64, account: &Account) -> Result<SignedTransaction> {
        if self.from != account.address() {
            return Err(LedgerError::Key(format!(
                "transaction sender {} does not match signing key {}",
                self.from,
                account.address()
            )));
        }
        let message = self.signing_bytes(chain_id)?;
        let signature = account.sign(&message);
        Ok(SignedTransaction {
            chain_id,
            tx: self,
            public_key: account.public_key_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        })
    }
}

/// A transaction with its authorization attached, ready to be submitted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub chain_id: u64,
    pub tx: Transaction,
    /// The sender's ed25519 public key.
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn hash(&self) -> TxHash {
        let tx = &self.tx;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.chain_id.to_be_bytes());
        hasher.update(tx.from.as_bytes());
        hasher.update(&tx.nonce.to_be_bytes());
        hasher.update(&tx.fee_price.to_be_bytes());
        match &tx.request.to {
            Some(to) => hasher.update(&[1]).update(to.as_bytes()),
            None => hasher.update(&[0]),
        };
        hasher.update(&tx.request.value.to_be_bytes());
        hasher.update(&tx.request.gas_limit.to_be_bytes());
        hasher.update(&(tx.request.data.len() as u64).to_be_bytes());
        hasher.update(&tx.request.data);
        hasher.update(&self.public_key);
        hasher.update(&self.signature);
        TxHash(*hasher.finalize().as_bytes())
    }

    /// Check the signature and that the key owns the sender address.
    pub fn verify(&self) -> Result<Address> {
        let public = PublicKey::from_bytes(&self.public_key)
            .map_err(|e| LedgerError::Submission(format!("invalid public key: {}", e)))?;
        if Address::from_public_key(public.as_bytes()) != self.tx.from {
            return Err(LedgerError::Submission(format!(
                "public key does not belong to sender {}",
                self.tx.from
            )));
        }
        let signature = Signature::try_from(self.signature.as_slice())
            .map_err(|e| LedgerError::Submission(format!("malformed signature: {}", e)))?;
        let message = self.tx.signing_bytes(self.chain_id)?;
        public
            .verify(&message, &signature)
            .map_err(|_| LedgerError::Submission("invalid signature".to_string()))?;
        Ok(self.tx.from)
    }
}
