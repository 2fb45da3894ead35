use std::{future::Future, time::Duration};

use crate::{EngineError, EngineResult, LedgerClient, LedgerError, Receipt, TxHash};

/// Bounds a ledger call. On expiry the call future is dropped, so a late
/// answer can never be applied.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> EngineResult<T>
where
  F: Future<Output = Result<T, LedgerError>>,
{
  match tokio::time::timeout(limit, call).await {
    Ok(result) => result.map_err(EngineError::from),
    Err(_) => Err(EngineError::Timeout),
  }
}

/// Waits for `hash` to be mined. A receipt that reports failure becomes
/// `ContractRevert`.
pub async fn await_receipt(ledger: &dyn LedgerClient, hash: &TxHash, limit: Duration) -> EngineResult<Receipt> {
  let receipt = with_timeout(limit, ledger.wait_for_confirmation(hash)).await?;
  if !receipt.success {
    let reason = receipt.revert_reason.unwrap_or_else(|| "no reason given".to_string());
    return Err(EngineError::ContractRevert(reason));
  }
  Ok(receipt)
}
