use std::collections::{BTreeMap, BTreeSet};

use super::state::{intrinsic_gas, WorldState};
use crate::account::Address;
use crate::error::{LedgerError, Result};
use crate::tx::{SignedTransaction, TxHash};

/// How far past the pending nonce a transaction may be queued.
pub const MAX_NONCE_GAP: u64 = 64;

/// Admitted transactions not yet included, keyed by sender and nonce.
#[derive(Debug, Default)]
pub struct Mempool {
    pending: BTreeMap<(Address, u64), SignedTransaction>,
}

fn cost(signed: &SignedTransaction) -> u128 {
    signed.tx.max_fee().saturating_add(signed.tx.request.value)
}

impl Mempool {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Confirmed nonce advanced past every contiguous pooled transaction.
    pub fn pending_nonce(&self, state: &WorldState, address: &Address) -> u64 {
        let mut nonce = state.nonce(address);
        while self.pending.contains_key(&(*address, nonce)) {
            nonce += 1;
        }
        nonce
    }

    fn pooled_cost(&self, address: &Address) -> u128 {
        self.pending
            .range((*address, 0)..=(*address, u64::MAX))
            .map(|(_, tx)| cost(tx))
            .fold(0u128, u128::saturating_add)
    }

    pub fn admit(
        &mut self,
        signed: SignedTransaction,
        state: &WorldState,
        chain_id: u64,
        min_fee_price: u128,
    ) -> Result<TxHash> {
        let sender = signed.verify()?;
        let tx = &signed.tx;

        if signed.chain_id != chain_id {
            return Err(LedgerError::Submission(format!(
                "invalid chain id {}, expected {}",
                signed.chain_id, chain_id
            )));
        }
        if tx.fee_price < min_fee_price {
            return Err(LedgerError::Submission(format!(
                "fee price {} below minimum {}",
                tx.fee_price, min_fee_price
            )));
        }
        let intrinsic = intrinsic_gas(tx.request.kind());
        if tx.request.gas_limit < intrinsic {
            return Err(LedgerError::Submission(format!(
                "intrinsic gas too low: {} < {}",
                tx.request.gas_limit, intrinsic
            )));
        }

        let confirmed = state.nonce(&sender);
        if tx.nonce < confirmed {
            return Err(LedgerError::Submission(format!(
                "nonce too low: {} < {}",
                tx.nonce, confirmed
            )));
        }
        if self.pending.contains_key(&(sender, tx.nonce)) {
            return Err(LedgerError::Submission(format!(
                "nonce {} already pending for {}",
                tx.nonce, sender
            )));
        }
        let pending_nonce = self.pending_nonce(state, &sender);
        if tx.nonce > pending_nonce + MAX_NONCE_GAP {
            return Err(LedgerError::Submission(format!(
                "nonce too high: {} > {}",
                tx.nonce,
                pending_nonce + MAX_NONCE_GAP
            )));
        }

        let required = cost(&signed).saturating_add(self.pooled_cost(&sender));
        let balance = state.balance(&sender);
        if required > balance {
            return Err(LedgerError::Submission(format!(
                "insufficient funds: balance {}, required {}",
                balance, required
            )));
        }

        let hash = signed.hash();
        self.pending.insert((sender, signed.tx.nonce), signed);
        Ok(hash)
    }

    /// Every transaction whose nonce continues its sender's confirmed nonce
    /// without a gap, grouped by sender in nonce order. Entries stay pooled
    /// until [`prune`](Self::prune) runs against the state that includes them.
    pub fn executable(&self, state: &WorldState) -> Vec<SignedTransaction> {
        let senders: BTreeSet<Address> = self.pending.keys().map(|(a, _)| *a).collect();
        let mut out = Vec::new();
        for sender in senders {
            let mut nonce = state.nonce(&sender);
            while let Some(tx) = self.pending.get(&(sender, nonce)) {
                out.push(tx.clone());
                nonce += 1;
            }
        }
        out
    }

    /// Drop transactions whose nonce has already been used.
    pub fn prune(&mut self, state: &WorldState) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|(sender, nonce), _| *nonce >= state.nonce(sender));
        before - self.pending.len()
    }
}
