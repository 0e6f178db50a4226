//! Ordered submission of dependent transactions from a single account.
//!
//! A [`Sequencer`] is caller-owned state for one run of transactions. It asks
//! the ledger for the account's pending nonce exactly once, in
//! [`Sequencer::prepare`], and from then on derives every nonce locally as
//! `base + k`. Re-querying between sends races with the node: a transaction
//! that was just accepted is not always visible in the next nonce query.
//!
//! Every network call is bounded by a timeout. The first failure aborts the
//! sequence; nothing is retried and nothing already submitted is rolled
//! back. To resume, prepare a fresh sequencer, which re-queries the nonce.
//!
//! Mutating methods take `&mut self`, so one sequencer is a single writer of
//! its nonce counter. Independent accounts get independent sequencers.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::account::{Account, Address};
use crate::blockchain::Confirmation;
use crate::client::{bounded, LedgerClient};
use crate::error::{LedgerError, Result, SequenceError, Stage};
use crate::tx::{Transaction, TxHash, TxRequest};

/// Nonce of the `k`-th (0-indexed) transaction of a sequence starting at `base_nonce`.
pub fn next_nonce(base_nonce: u64, k: u64) -> Result<u64> {
    base_nonce.checked_add(k).ok_or_else(|| {
        LedgerError::query(
            "nonce",
            format!("nonce space exhausted: {} + {}", base_nonce, k),
        )
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerOptions {
    /// Upper bound on waiting for a single transaction to be included.
    pub confirmation_timeout: Duration,
    /// Upper bound on any other single network call.
    pub rpc_timeout: Duration,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of one transaction of the sequence.
///
/// `Confirmed` is the only successful terminal state. `Reverted`, `TimedOut`
/// and `Rejected` are terminal failures with no automatic way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Built,
    Signed,
    Submitted,
    Confirmed,
    Reverted,
    TimedOut,
    Rejected,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxState::Confirmed | TxState::Reverted | TxState::TimedOut | TxState::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Transaction {
        nonce: u64,
        hash: Option<TxHash>,
        state: TxState,
    },
    /// Read-only query; carries no nonce.
    View { completed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub index: usize,
    pub label: String,
    pub kind: StepKind,
}

impl StepRecord {
    pub fn nonce(&self) -> Option<u64> {
        match &self.kind {
            StepKind::Transaction { nonce, .. } => Some(*nonce),
            StepKind::View { .. } => None,
        }
    }

    pub fn state(&self) -> Option<TxState> {
        match &self.kind {
            StepKind::Transaction { state, .. } => Some(*state),
            StepKind::View { .. } => None,
        }
    }

    pub fn hash(&self) -> Option<TxHash> {
        match &self.kind {
            StepKind::Transaction { hash, .. } => *hash,
            StepKind::View { .. } => None,
        }
    }
}

/// A built transaction with its nonce fixed, not yet signed.
#[must_use = "a built transaction holds a nonce; submit it or the sequence stalls"]
#[derive(Debug, PartialEq, Eq)]
pub struct Prepared {
    step: usize,
    tx: Transaction,
}

impl Prepared {
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn nonce(&self) -> u64 {
        self.tx.nonce
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }
}

/// Handle on a submitted, not yet confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    step: usize,
    hash: TxHash,
}

impl InFlight {
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn hash(&self) -> TxHash {
        self.hash
    }
}

pub struct Sequencer<'a, C: ?Sized> {
    client: &'a C,
    account: &'a Account,
    options: SequencerOptions,
    chain_id: u64,
    base_nonce: u64,
    fee_price: u128,
    built: u64,
    submitted: u64,
    steps: Vec<StepRecord>,
    in_flight: Vec<InFlight>,
    aborted: Option<Stage>,
}

impl<'a, C: LedgerClient + ?Sized> Sequencer<'a, C> {
    /// Query chain id, pending nonce and fee price once for `account`.
    pub async fn prepare(
        client: &'a C,
        account: &'a Account,
        options: SequencerOptions,
    ) -> std::result::Result<Self, SequenceError> {
        let address = account.address();
        let limit = options.rpc_timeout;
        let prepare_err = |e| SequenceError::new(Stage::Prepare, e);

        let chain_id = bounded(limit, "chain id", client.chain_id())
            .await
            .map_err(prepare_err)?;
        let base_nonce = bounded(limit, "nonce", client.pending_nonce(&address))
            .await
            .map_err(prepare_err)?;
        let fee_price = bounded(limit, "fee price", client.suggest_fee_price())
            .await
            .map_err(prepare_err)?;

        info!(%address, chain_id, base_nonce, fee_price = %fee_price, "sequence prepared");

        Ok(Self {
            client,
            account,
            options,
            chain_id,
            base_nonce,
            fee_price,
            built: 0,
            submitted: 0,
            steps: Vec::new(),
            in_flight: Vec::new(),
            aborted: None,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn base_nonce(&self) -> u64 {
        self.base_nonce
    }

    pub fn fee_price(&self) -> u128 {
        self.fee_price
    }

    pub fn address(&self) -> Address {
        self.account.address()
    }

    pub fn client(&self) -> &'a C {
        self.client
    }

    /// Nonce the next built transaction will carry.
    pub fn upcoming_nonce(&self) -> Result<u64> {
        next_nonce(self.base_nonce, self.built)
    }

    pub fn options(&self) -> &SequencerOptions {
        &self.options
    }

    pub fn journal(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn in_flight(&self) -> &[InFlight] {
        &self.in_flight
    }

    /// Stage that aborted the sequence, if any.
    pub fn aborted_at(&self) -> Option<&Stage> {
        self.aborted.as_ref()
    }

    /// Fix the nonce and fee of the next transaction. Transactions must be
    /// submitted in the order they are built.
    pub fn build(
        &mut self,
        label: impl Into<String>,
        request: TxRequest,
    ) -> std::result::Result<Prepared, SequenceError> {
        let label = label.into();
        let index = self.steps.len();
        self.ensure_live(index, &label)?;

        let nonce = match next_nonce(self.base_nonce, self.built) {
            Ok(nonce) => nonce,
            Err(e) => {
                let stage = Stage::Step { index, label };
                return Err(self.abort(stage, e));
            }
        };
        self.built += 1;
        let tx = Transaction::new(self.account.address(), nonce, self.fee_price, request);
        debug!(step = index, %label, nonce, kind = ?tx.request.kind(), "transaction built");

        self.steps.push(StepRecord {
            index,
            label,
            kind: StepKind::Transaction {
                nonce,
                hash: None,
                state: TxState::Built,
            },
        });
        Ok(Prepared { step: index, tx })
    }

    /// Sign and submit without waiting for inclusion.
    pub async fn submit(&mut self, prepared: Prepared) -> std::result::Result<InFlight, SequenceError> {
        let Prepared { step, tx } = prepared;
        self.ensure_live(step, &self.label(step))?;

        let expected = match next_nonce(self.base_nonce, self.submitted) {
            Ok(expected) => expected,
            Err(e) => return Err(self.fail(step, e)),
        };
        if tx.nonce != expected {
            let reason = format!(
                "nonce {} submitted out of order, expected {}",
                tx.nonce, expected
            );
            return Err(self.fail(step, LedgerError::Submission(reason)));
        }

        let nonce = tx.nonce;
        let signed = match tx.sign(self.chain_id, self.account) {
            Ok(signed) => signed,
            Err(e) => return Err(self.fail(step, e)),
        };
        let hash = signed.hash();
        self.record(step, Some(hash), TxState::Signed);

        let client = self.client;
        let limit = self.options.rpc_timeout;
        match tokio::time::timeout(limit, client.submit(&signed)).await {
            Ok(Ok(accepted)) => {
                if accepted != hash {
                    warn!(step, local = %hash, remote = %accepted, "ledger reported a different transaction hash");
                }
            }
            Ok(Err(e)) => {
                self.record(step, None, TxState::Rejected);
                return Err(self.fail(step, e));
            }
            Err(_) => {
                self.record(step, None, TxState::TimedOut);
                let reason = format!(
                    "no response within {:?}, the transaction may still be included",
                    limit
                );
                return Err(self.fail(step, LedgerError::Submission(reason)));
            }
        }

        self.submitted += 1;
        self.record(step, None, TxState::Submitted);
        info!(step, nonce, %hash, "transaction submitted");

        let in_flight = InFlight { step, hash };
        self.in_flight.push(in_flight);
        Ok(in_flight)
    }

    /// Wait for a submitted transaction to be included and to succeed.
    pub async fn wait(&mut self, in_flight: InFlight) -> std::result::Result<Confirmation, SequenceError> {
        let InFlight { step, hash } = in_flight;
        self.ensure_live(step, &self.label(step))?;
        self.in_flight.retain(|f| f.step != step);

        let client = self.client;
        let limit = self.options.confirmation_timeout;
        debug!(step, %hash, timeout = ?limit, "waiting for inclusion");
        let outcome =
            match tokio::time::timeout(limit, client.wait_for_inclusion(&hash, limit)).await {
                Ok(result) => result,
                Err(_) => Err(LedgerError::ConfirmationTimeout {
                    hash,
                    timeout: limit,
                }),
            };

        match outcome {
            Ok(confirmation) if confirmation.status.is_success() => {
                self.record(step, None, TxState::Confirmed);
                info!(step, %hash, block = confirmation.block_number, "transaction confirmed");
                Ok(confirmation)
            }
            Ok(confirmation) => {
                self.record(step, None, TxState::Reverted);
                Err(self.fail(
                    step,
                    LedgerError::ConfirmationFailure {
                        hash,
                        block_number: confirmation.block_number,
                    },
                ))
            }
            Err(e @ LedgerError::ConfirmationTimeout { .. }) => {
                self.record(step, None, TxState::TimedOut);
                Err(self.fail(step, e))
            }
            // the fate of the transaction is unknown, it stays Submitted
            Err(e) => Err(self.fail(step, e)),
        }
    }

    pub async fn submit_and_wait(
        &mut self,
        prepared: Prepared,
    ) -> std::result::Result<Confirmation, SequenceError> {
        let in_flight = self.submit(prepared).await?;
        self.wait(in_flight).await
    }

    /// Build, submit and confirm one transaction.
    pub async fn transact(
        &mut self,
        label: impl Into<String>,
        request: TxRequest,
    ) -> std::result::Result<Confirmation, SequenceError> {
        let prepared = self.build(label, request)?;
        self.submit_and_wait(prepared).await
    }

    /// Wait for every in-flight transaction, oldest first.
    pub async fn settle(&mut self) -> std::result::Result<Vec<Confirmation>, SequenceError> {
        let mut confirmations = Vec::with_capacity(self.in_flight.len());
        while let Some(first) = self.in_flight.first().copied() {
            confirmations.push(self.wait(first).await?);
        }
        Ok(confirmations)
    }

    /// Read-only contract query. Issued only after every earlier transaction
    /// of the sequence is confirmed, so it observes their effects.
    pub async fn view(
        &mut self,
        label: impl Into<String>,
        contract: &Address,
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, SequenceError> {
        let label = label.into();
        self.ensure_live(self.steps.len(), &label)?;
        self.settle().await?;

        let index = self.steps.len();
        self.steps.push(StepRecord {
            index,
            label,
            kind: StepKind::View { completed: false },
        });

        let client = self.client;
        match bounded(self.options.rpc_timeout, "contract call", client.call(contract, data)).await {
            Ok(bytes) => {
                if let Some(record) = self.steps.get_mut(index) {
                    record.kind = StepKind::View { completed: true };
                }
                Ok(bytes)
            }
            Err(e) => Err(self.fail(index, e)),
        }
    }

    fn label(&self, step: usize) -> String {
        self.steps
            .get(step)
            .map(|s| s.label.clone())
            .unwrap_or_default()
    }

    fn ensure_live(&self, index: usize, label: &str) -> std::result::Result<(), SequenceError> {
        match &self.aborted {
            None => Ok(()),
            Some(failed) => Err(SequenceError::new(
                Stage::Step {
                    index,
                    label: label.to_string(),
                },
                LedgerError::Aborted {
                    failed_step: failed.to_string(),
                },
            )),
        }
    }

    fn record(&mut self, step: usize, new_hash: Option<TxHash>, new_state: TxState) {
        if let Some(StepRecord {
            kind: StepKind::Transaction { hash, state, .. },
            ..
        }) = self.steps.get_mut(step)
        {
            if new_hash.is_some() {
                *hash = new_hash;
            }
            *state = new_state;
        }
    }

    fn fail(&mut self, step: usize, source: LedgerError) -> SequenceError {
        let stage = Stage::Step {
            index: step,
            label: self.label(step),
        };
        self.abort(stage, source)
    }

    fn abort(&mut self, stage: Stage, source: LedgerError) -> SequenceError {
        error!(%stage, error = %source, "sequence aborted");
        self.aborted = Some(stage.clone());
        SequenceError::new(stage, source)
    }
}
