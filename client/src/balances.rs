use std::{sync::Arc, time::Duration};

use moka::future::Cache as MokaCache;

use crate::{
  util::with_timeout, Address, BalanceSnapshot, EngineEvent, EngineResult, EventBus, LedgerClient, LedgerError,
  RawAmount, MAX_TOKEN_DECIMALS,
};

type ArcSnapshot = Arc<BalanceSnapshot>;
type SnapshotCache = MokaCache<Address, ArcSnapshot>;

/// Balance snapshots of the connected account, one per token.
///
/// Snapshots are read-through with a short TTL and are invalidated after
/// every confirmed write that touches the token. Allowances gate writes, so
/// they always come straight from the ledger.
pub struct BalanceBook {
  ledger: Arc<dyn LedgerClient>,
  events: EventBus,
  account: Address,
  read_timeout: Duration,
  snapshots: SnapshotCache,
}

impl BalanceBook {
  pub fn new(
    ledger: Arc<dyn LedgerClient>,
    events: EventBus,
    account: Address,
    ttl: Duration,
    read_timeout: Duration,
  ) -> Self {
    Self { ledger, events, account, read_timeout, snapshots: SnapshotCache::builder().time_to_live(ttl).build() }
  }

  pub async fn snapshot(&self, token: &Address) -> EngineResult<ArcSnapshot> {
    if let Some(cached) = self.snapshots.get(token).await {
      return Ok(cached);
    }

    let snapshot = Arc::new(self.read(token).await?);
    self.snapshots.insert(token.clone(), snapshot.clone()).await;
    Ok(snapshot)
  }

  /// Drops the cached snapshot, reads a fresh one and asks for a balance
  /// re-render.
  pub async fn refresh(&self, token: &Address) -> EngineResult<ArcSnapshot> {
    self.snapshots.invalidate(token).await;
    let snapshot = self.snapshot(token).await?;
    self.events.emit(EngineEvent::RenderBalances(token.clone()));
    Ok(snapshot)
  }

  pub async fn invalidate(&self, token: &Address) {
    self.snapshots.invalidate(token).await;
  }

  pub async fn allowance(&self, token: &Address, spender: &Address) -> EngineResult<RawAmount> {
    with_timeout(self.read_timeout, self.ledger.get_allowance(token, &self.account, spender)).await
  }

  async fn read(&self, token: &Address) -> EngineResult<BalanceSnapshot> {
    let (available, staked, pending_rewards, decimals) = futures::try_join!(
      with_timeout(self.read_timeout, self.ledger.get_balance(token, &self.account)),
      with_timeout(self.read_timeout, self.ledger.get_staked(token, &self.account)),
      with_timeout(self.read_timeout, self.ledger.get_pending_rewards(token, &self.account)),
      with_timeout(self.read_timeout, self.ledger.get_decimals(token)),
    )?;
    if decimals > MAX_TOKEN_DECIMALS {
      return Err(LedgerError::Malformed(format!("{token} reports {decimals} decimals")).into());
    }

    tracing::debug!("read balances of {} for {}: available {} staked {}", token, self.account, available, staked);
    Ok(BalanceSnapshot { available, staked, pending_rewards, decimals })
  }
}
