mod mock;

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{sample_proposal, ConfirmOutcome, MockLedger};

use crate::{Address, Proposal, ProposalAction, RawAmount};

/// Errors raised by a ledger client. They describe the transport or the
/// chain; the engine converts them into `EngineError` kinds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
  #[error("transport error: {0}")]
  Transport(String),

  #[error("rpc error {code}: {message}")]
  Rpc { code: i64, message: String },

  #[error("{0} is not available on this endpoint")]
  Unavailable(String),

  #[error("user rejected the signing request")]
  UserRejected,

  #[error("insufficient funds for transaction")]
  InsufficientFunds,

  #[error("execution reverted: {0}")]
  Reverted(String),

  #[error("request timed out")]
  Timeout,

  #[error("malformed response: {0}")]
  Malformed(String),

  #[error("proposal {0} not found")]
  NotFound(u64),
}

impl LedgerError {
  /// Errors that another redundant endpoint might not have.
  pub fn is_endpoint_failure(&self) -> bool {
    matches!(self, LedgerError::Transport(_) | LedgerError::Timeout)
  }
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TxHash(pub String);

/// A write against the governance/staking contracts. Signing happens inside
/// the wallet behind `LedgerClient::submit`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Transaction {
  Approve { token: Address, spender: Address, amount: RawAmount },
  Stake { token: Address, amount: RawAmount },
  Unstake { token: Address, amount: RawAmount },
  Claim { token: Address },
  CreateProposal { action: ProposalAction },
  ApproveProposal { id: u64 },
  RejectProposal { id: u64 },
  ExecuteProposal { id: u64 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
  pub hash: TxHash,
  pub block_number: u64,
  pub success: bool,
  #[serde(default)]
  pub revert_reason: Option<String>,
  /// Set when the transaction created a proposal.
  #[serde(default)]
  pub proposal_id: Option<u64>,
}

/// Read and write access to the authoritative contract state.
///
/// Every call is slow and may fail. Implementations must not retry writes.
#[async_trait]
pub trait LedgerClient: Send + Sync {
  /// The ledger's current proposal list, newest first.
  async fn list_proposals(&self) -> Result<Vec<Proposal>, LedgerError>;

  /// One page of proposals, newest first, skipping the `skip` newest.
  async fn list_proposals_paged(&self, skip: u64, limit: u64) -> Result<Vec<Proposal>, LedgerError>;

  async fn get_proposal(&self, id: u64) -> Result<Proposal, LedgerError>;

  /// Number of proposals ever created. Ids run from 1 to this count.
  async fn get_proposal_count(&self) -> Result<u64, LedgerError>;

  async fn get_allowance(&self, token: &Address, owner: &Address, spender: &Address) -> Result<RawAmount, LedgerError>;

  async fn get_balance(&self, token: &Address, owner: &Address) -> Result<RawAmount, LedgerError>;

  async fn get_staked(&self, token: &Address, owner: &Address) -> Result<RawAmount, LedgerError>;

  async fn get_pending_rewards(&self, token: &Address, owner: &Address) -> Result<RawAmount, LedgerError>;

  async fn get_decimals(&self, token: &Address) -> Result<u32, LedgerError>;

  /// Asks the wallet to sign and broadcast `tx`. Returns once the network
  /// accepted it for inclusion.
  async fn submit(&self, tx: &Transaction) -> Result<TxHash, LedgerError>;

  /// Resolves when `hash` is included. Waits indefinitely; callers bound it.
  async fn wait_for_confirmation(&self, hash: &TxHash) -> Result<Receipt, LedgerError>;
}
