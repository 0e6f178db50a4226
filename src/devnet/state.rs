use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::account::Address;
use crate::blockchain::TxStatus;
use crate::counter::{CounterCall, CounterEvent, COUNTER_CODE};
use crate::error::{LedgerError, Result};
use crate::tx::{SignedTransaction, TxKind, TRANSFER_GAS};

pub const DEPLOY_GAS: u64 = 120_000;
pub const CALL_GAS: u64 = 45_000;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: u128,
    /// Transactions included so far.
    pub nonce: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CounterStorage {
    pub owner: Address,
    pub count: u128,
}

/// Result of applying one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: TxStatus,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
    pub events: Vec<(Address, CounterEvent)>,
}

impl Outcome {
    fn reverted(gas_used: u64) -> Self {
        Self {
            status: TxStatus::Reverted,
            gas_used,
            contract_address: None,
            events: Vec::new(),
        }
    }

    fn success(gas_used: u64) -> Self {
        Self {
            status: TxStatus::Success,
            gas_used,
            contract_address: None,
            events: Vec::new(),
        }
    }
}

pub fn intrinsic_gas(kind: TxKind) -> u64 {
    match kind {
        TxKind::Transfer => TRANSFER_GAS,
        TxKind::Deploy => DEPLOY_GAS,
        TxKind::Call => CALL_GAS,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldState {
    pub accounts: BTreeMap<Address, AccountState>,
    pub contracts: BTreeMap<Address, CounterStorage>,
}

impl WorldState {
    pub fn genesis(alloc: &[(Address, u128)]) -> Self {
        let mut state = WorldState::default();
        for (address, balance) in alloc {
            state.account_mut(address).balance += balance;
        }
        state
    }

    pub fn balance(&self, address: &Address) -> u128 {
        self.accounts.get(address).map(|a| a.balance).unwrap_or(0)
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    fn account_mut(&mut self, address: &Address) -> &mut AccountState {
        self.accounts.entry(*address).or_default()
    }

    /// Apply an admitted transaction. The sender's nonce always advances and
    /// the gas used is always charged, even when execution reverts.
    pub fn apply(&mut self, signed: &SignedTransaction, coinbase: &Address) -> Outcome {
        let tx = &signed.tx;
        let request = &tx.request;
        let kind = request.kind();
        let needed = intrinsic_gas(kind);
        let gas_used = needed.min(request.gas_limit);

        let sender = self.account_mut(&tx.from);
        sender.nonce += 1;
        let fee = (gas_used as u128)
            .saturating_mul(tx.fee_price)
            .min(sender.balance);
        sender.balance -= fee;
        let remaining = sender.balance;
        self.account_mut(coinbase).balance += fee;

        if request.gas_limit < needed || remaining < request.value {
            return Outcome::reverted(gas_used);
        }

        let outcome = match (kind, request.to) {
            (TxKind::Deploy, _) => self.deploy(signed, gas_used),
            (TxKind::Transfer, Some(to)) if self.contracts.contains_key(&to) => {
                // the Counter contract does not accept plain transfers
                Outcome::reverted(gas_used)
            }
            (TxKind::Transfer, Some(_)) => Outcome::success(gas_used),
            (TxKind::Call, Some(to)) => self.execute(&to, &request.data, request.value, gas_used),
            (_, None) => Outcome::reverted(gas_used),
        };

        if outcome.status.is_success() && request.value > 0 {
            if let Some(to) = request.to {
                self.account_mut(&tx.from).balance -= request.value;
                self.account_mut(&to).balance += request.value;
            }
        }
        outcome
    }

    fn deploy(&mut self, signed: &SignedTransaction, gas_used: u64) -> Outcome {
        let tx = &signed.tx;
        if tx.request.data != COUNTER_CODE || tx.request.value > 0 {
            return Outcome::reverted(gas_used);
        }
        let address = Address::for_contract(&tx.from, tx.nonce);
        if self.contracts.contains_key(&address) {
            return Outcome::reverted(gas_used);
        }
        self.contracts.insert(
            address,
            CounterStorage {
                owner: tx.from,
                count: 0,
            },
        );
        Outcome {
            contract_address: Some(address),
            ..Outcome::success(gas_used)
        }
    }

    fn execute(
        &mut self,
        contract: &Address,
        data: &[u8],
        value: u128,
        gas_used: u64,
    ) -> Outcome {
        let call = match CounterCall::decode(data) {
            Ok(call) => call,
            Err(_) => return Outcome::reverted(gas_used),
        };
        let storage = match self.contracts.get_mut(contract) {
            Some(storage) if value == 0 => storage,
            _ => return Outcome::reverted(gas_used),
        };

        let event = match call {
            CounterCall::GetCount | CounterCall::Owner => None,
            CounterCall::Increment => match storage.count.checked_add(1) {
                Some(count) => {
                    storage.count = count;
                    Some(CounterEvent::Incremented { new_count: count })
                }
                None => return Outcome::reverted(gas_used),
            },
            CounterCall::Decrement => match storage.count.checked_sub(1) {
                Some(count) => {
                    storage.count = count;
                    Some(CounterEvent::Decremented { new_count: count })
                }
                None => return Outcome::reverted(gas_used),
            },
            CounterCall::Reset => {
                storage.count = 0;
                Some(CounterEvent::Reset { new_count: 0 })
            }
        };

        Outcome {
            events: event.map(|e| vec![(*contract, e)]).unwrap_or_default(),
            ..Outcome::success(gas_used)
        }
    }

    /// Read-only contract call.
    pub fn call(&self, contract: &Address, data: &[u8]) -> Result<Vec<u8>> {
        let storage = self
            .contracts
            .get(contract)
            .ok_or_else(|| LedgerError::query("contract call", format!("no contract at {}", contract)))?;
        let call = CounterCall::decode(data)
            .map_err(|e| LedgerError::query("contract call", e))?;
        let out = match call {
            CounterCall::GetCount => bincode::serialize(&storage.count)?,
            CounterCall::Owner => bincode::serialize(&storage.owner)?,
            other => {
                return Err(LedgerError::query(
                    "contract call",
                    format!("{:?} is not a view method", other),
                ))
            }
        };
        Ok(out)
    }
}
