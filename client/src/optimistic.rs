use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;

use crate::{
  util::{await_receipt, with_timeout},
  Address, EngineError, EngineEvent, EngineResult, EventBus, LedgerClient, Proposal, ProposalAction, ProposalCache,
  ProposalId, SelectiveSynchronizer, Settings, TxHash,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertionStatus {
  InFlight { tx: TxHash },
  Failed { reason: String },
}

/// How a confirmed creation ended up in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
  /// The provisional record was replaced by the ledger's record.
  Reconciled(u64),
  /// The real id is known and linked, but the record could not be read yet.
  /// The next successful sync replaces the provisional record.
  Linked(u64),
  /// The provisional record was discarded before the result arrived.
  Ignored,
}

/// Keeps newly submitted proposals visible between submission and
/// confirmation.
pub struct OptimisticTracker {
  ledger: Arc<dyn LedgerClient>,
  cache: Arc<ProposalCache>,
  synchronizer: Arc<SelectiveSynchronizer>,
  events: EventBus,
  account: Address,
  required_approvals: u32,
  poll_delay: Duration,
  confirm_timeout: Duration,
  read_timeout: Duration,
  next_local: AtomicU64,
  statuses: Mutex<HashMap<ProposalId, InsertionStatus>>,
}

impl OptimisticTracker {
  pub fn new(
    ledger: Arc<dyn LedgerClient>,
    cache: Arc<ProposalCache>,
    synchronizer: Arc<SelectiveSynchronizer>,
    events: EventBus,
    settings: &Settings,
  ) -> Self {
    Self {
      ledger,
      cache,
      synchronizer,
      events,
      account: settings.account.clone(),
      required_approvals: settings.default_required_approvals,
      poll_delay: settings.confirm_poll_delay,
      confirm_timeout: settings.confirm_timeout,
      read_timeout: settings.sync_timeout,
      next_local: AtomicU64::new(0),
      statuses: Mutex::new(HashMap::new()),
    }
  }

  /// Inserts a provisional record for a creation the ledger accepted but
  /// has not mined yet.
  pub fn insert_provisional(&self, action: ProposalAction, tx: TxHash) -> ProposalId {
    let id = ProposalId::Provisional(self.next_local.fetch_add(1, Ordering::Relaxed) + 1);
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs() as i64).unwrap_or_default();

    let proposal = Proposal {
      id,
      action,
      approval_count: 0,
      required_approvals: self.required_approvals,
      executed: false,
      rejected: false,
      expired: false,
      proposer: self.account.clone(),
      created_at: now,
      // unknown until the ledger assigns it
      expires_at: now,
      is_optimistic: true,
    };

    self.cache.put(proposal);
    self.statuses.lock().insert(id, InsertionStatus::InFlight { tx: tx.clone() });
    tracing::info!("inserted provisional proposal {} for {}", id, tx);
    self.events.emit(EngineEvent::RenderProposal(id));
    self.events.emit(EngineEvent::CacheChanged);
    id
  }

  /// Waits for the creating transaction and reconciles the provisional
  /// record. On revert, failure or timeout the record is flagged `Failed`.
  pub async fn track_confirmation(&self, provisional: ProposalId, tx: &TxHash) -> EngineResult<Confirmation> {
    let receipt = match await_receipt(self.ledger.as_ref(), tx, self.confirm_timeout).await {
      Ok(receipt) => receipt,
      Err(error) => {
        let reason = match &error {
          EngineError::Timeout => format!("not confirmed within {}s", self.confirm_timeout.as_secs()),
          other => other.to_string(),
        };
        self.mark_failed(provisional, reason);
        return Err(error);
      }
    };
    self.reconcile(provisional, receipt.proposal_id).await
  }

  /// Replaces `provisional` with the authoritative record. `created` is the
  /// id named by the receipt; without it the ledger's newest id is used.
  ///
  /// The real id is linked before the poll delay, so a sync that lands the
  /// record in the meantime drops the provisional one in the same write.
  pub async fn reconcile(&self, provisional: ProposalId, created: Option<u64>) -> EngineResult<Confirmation> {
    debug_assert!(provisional.is_provisional());
    if !self.cache.contains(provisional) {
      return Ok(Confirmation::Ignored);
    }

    let id = match created {
      Some(id) => id,
      None => match self.newest_id().await {
        Ok(id) => id,
        Err(error) => {
          self.mark_failed(provisional, "confirmed, but the new proposal could not be located".to_string());
          return Err(error);
        }
      },
    };

    if self.cache.link(provisional, id) {
      self.settle(provisional, id);
      return Ok(Confirmation::Reconciled(id));
    }

    tokio::time::sleep(self.poll_delay).await;
    if !self.cache.contains(provisional) {
      if self.cache.contains(ProposalId::Confirmed(id)) {
        self.settle(provisional, id);
        return Ok(Confirmation::Reconciled(id));
      }
      return Ok(Confirmation::Ignored);
    }

    match with_timeout(self.read_timeout, self.ledger.get_proposal(id)).await {
      Ok(proposal) if proposal.id == ProposalId::Confirmed(id) => {
        if !self.cache.contains(provisional) {
          return Ok(Confirmation::Ignored);
        }
        self.cache.put(proposal);
        self.settle(provisional, id);
        Ok(Confirmation::Reconciled(id))
      }
      read => {
        tracing::warn!("reading new proposal #{} failed ({:?}), retrying via full reload", id, read.err());
        if let Err(error) = self.synchronizer.full_reload().await {
          tracing::warn!("full reload after creating #{} failed: {}", id, error);
        }
        if self.cache.contains(ProposalId::Confirmed(id)) {
          self.settle(provisional, id);
          Ok(Confirmation::Reconciled(id))
        } else {
          Ok(Confirmation::Linked(id))
        }
      }
    }
  }

  /// Flags a provisional record as failed. It stays visible until discarded.
  pub fn mark_failed(&self, provisional: ProposalId, reason: String) {
    if !self.cache.contains(provisional) {
      return;
    }
    tracing::warn!("provisional proposal {} failed: {}", provisional, reason);
    self.statuses.lock().insert(provisional, InsertionStatus::Failed { reason });
    self.events.emit(EngineEvent::RenderProposal(provisional));
  }

  /// Removes a failed provisional record. In-flight records cannot be
  /// discarded.
  pub fn discard(&self, provisional: ProposalId) -> bool {
    let mut statuses = self.statuses.lock();
    if !matches!(statuses.get(&provisional), Some(InsertionStatus::Failed { .. })) {
      return false;
    }
    statuses.remove(&provisional);
    drop(statuses);

    self.cache.remove(provisional);
    self.events.emit(EngineEvent::CacheChanged);
    true
  }

  pub fn status(&self, provisional: ProposalId) -> Option<InsertionStatus> {
    self.prune();
    self.statuses.lock().get(&provisional).cloned()
  }

  /// Provisional records still in the cache, with their status.
  pub fn pending(&self) -> Vec<(ProposalId, InsertionStatus)> {
    self.prune();
    let mut pending: Vec<_> = self.statuses.lock().iter().map(|(id, status)| (*id, status.clone())).collect();
    pending.sort_by(|a, b| b.0.cmp(&a.0));
    pending
  }

  async fn newest_id(&self) -> EngineResult<u64> {
    match with_timeout(self.read_timeout, self.ledger.get_proposal_count()).await {
      Ok(count) if count > 0 => Ok(count),
      Ok(_) => Err(EngineError::TransientRead("ledger reports no proposals".to_string())),
      Err(error) => Err(error),
    }
  }

  fn settle(&self, provisional: ProposalId, id: u64) {
    self.statuses.lock().remove(&provisional);
    tracing::info!("provisional proposal {} is now #{}", provisional, id);
    self.events.emit(EngineEvent::RenderProposal(ProposalId::Confirmed(id)));
    self.events.emit(EngineEvent::CacheChanged);
  }

  // A sync may have resolved a linked record behind our back.
  fn prune(&self) {
    self.statuses.lock().retain(|id, _| self.cache.contains(*id));
  }
}
