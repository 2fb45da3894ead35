use thiserror::Error;

use crate::{LedgerError, OperationKind};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failure kinds surfaced by the engine. Ledger and transport errors are
/// converted into one of these at the synchronizer, loader and orchestrator
/// boundaries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
  #[error("ledger read failed: {0}")]
  TransientRead(String),

  #[error("cached proposals changed while the update was in flight")]
  StaleData,

  #[error("request was rejected in the wallet")]
  UserRejected,

  #[error("insufficient funds")]
  InsufficientFunds,

  #[error("spending allowance is still below the requested amount")]
  InsufficientAllowance,

  #[error("transaction reverted: {0}")]
  ContractRevert(String),

  #[error("ledger did not respond in time")]
  Timeout,

  #[error("{0} is already in progress")]
  AlreadyInFlight(OperationKind),

  #[error("invalid input: {0}")]
  InvalidInput(String),
}

impl EngineError {
  /// Transient failures are worth another attempt through a fallback path.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::TransientRead(_) | Self::StaleData | Self::Timeout)
  }

  /// Short toast title for the failure.
  pub fn title(&self) -> &'static str {
    match self {
      Self::TransientRead(_) | Self::StaleData => "Network error",
      Self::UserRejected => "Request rejected",
      Self::InsufficientFunds => "Insufficient funds",
      Self::InsufficientAllowance => "Approval required",
      Self::ContractRevert(_) => "Transaction reverted",
      Self::Timeout => "Timed out",
      Self::AlreadyInFlight(_) => "Already in progress",
      Self::InvalidInput(_) => "Invalid request",
    }
  }

  /// User-facing explanation of the failure.
  pub fn user_message(&self) -> String {
    match self {
      Self::TransientRead(_) | Self::StaleData => "The ledger could not be reached. Please try again.".to_string(),
      Self::UserRejected => "The request was declined in your wallet.".to_string(),
      Self::InsufficientFunds => "Your balance is too low for this transaction.".to_string(),
      Self::InsufficientAllowance => "The spending approval has not taken effect yet.".to_string(),
      Self::ContractRevert(reason) => format!("The contract rejected the transaction: {reason}"),
      Self::Timeout => "The ledger did not confirm in time. Check your wallet before retrying.".to_string(),
      Self::AlreadyInFlight(kind) => format!("A {kind} transaction is already in progress."),
      Self::InvalidInput(reason) => reason.clone(),
    }
  }
}

impl From<LedgerError> for EngineError {
  fn from(error: LedgerError) -> Self {
    match error {
      LedgerError::UserRejected => Self::UserRejected,
      LedgerError::InsufficientFunds => Self::InsufficientFunds,
      LedgerError::Reverted(reason) => Self::ContractRevert(reason),
      LedgerError::Timeout => Self::Timeout,
      LedgerError::Transport(_)
      | LedgerError::Rpc { .. }
      | LedgerError::Unavailable(_)
      | LedgerError::Malformed(_)
      | LedgerError::NotFound(_) => Self::TransientRead(error.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ledger_error_conversion() {
    assert_eq!(EngineError::from(LedgerError::UserRejected), EngineError::UserRejected);
    assert_eq!(EngineError::from(LedgerError::InsufficientFunds), EngineError::InsufficientFunds);
    assert_eq!(EngineError::from(LedgerError::Timeout), EngineError::Timeout);
    assert_eq!(
      EngineError::from(LedgerError::Reverted("paused".to_string())),
      EngineError::ContractRevert("paused".to_string())
    );

    let transient = EngineError::from(LedgerError::Transport("connection reset".to_string()));
    assert!(matches!(&transient, EngineError::TransientRead(msg) if msg.contains("connection reset")));
    assert!(transient.is_transient());
    assert!(!EngineError::UserRejected.is_transient());
  }

  #[test]
  fn test_user_messages_are_kind_specific() {
    assert_eq!(EngineError::UserRejected.title(), "Request rejected");
    assert!(EngineError::ContractRevert("below minimum stake".to_string()).user_message().contains("below minimum stake"));
    assert!(EngineError::AlreadyInFlight(OperationKind::Stake).user_message().contains("stake"));
  }
}
