use std::{
  collections::HashSet,
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use crate::{
  util::{with_timeout, FlightGuard},
  EngineError, EngineEvent, EngineResult, EventBus, IncrementalLoader, LedgerClient, Proposal, ProposalCache,
  ProposalId, Wrapper,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// Another pass was already running.
  Coalesced,
  FullReload { count: u64 },
  Incremental { updated: Vec<u64> },
}

/// Keeps the proposal cache converging on the ledger with as little render
/// work as possible.
///
/// A pass first compares the ledger's proposal count with the last count it
/// saw. A different count means proposals were added (or the ledger answer
/// is inconsistent) and the whole cache is reloaded. Otherwise the list is
/// fetched and only records whose fingerprint moved are written back. The
/// diff is computed before anything is written and is applied only if no
/// full reload ran in between.
///
/// The list may be bounded to the newest proposals. Records below the lowest
/// listed id were paged in by the loader; passes and reloads leave them alone.
pub struct SelectiveSynchronizer {
  ledger: Arc<dyn LedgerClient>,
  cache: Arc<ProposalCache>,
  loader: Arc<IncrementalLoader>,
  events: EventBus,
  timeout: Duration,
  last_known_count: AtomicU64,
  selective: AtomicBool,
  in_flight: AtomicBool,
}

impl SelectiveSynchronizer {
  pub fn new(
    ledger: Arc<dyn LedgerClient>,
    cache: Arc<ProposalCache>,
    loader: Arc<IncrementalLoader>,
    events: EventBus,
    timeout: Duration,
  ) -> Self {
    Self {
      ledger,
      cache,
      loader,
      events,
      timeout,
      last_known_count: AtomicU64::new(0),
      selective: AtomicBool::new(true),
      in_flight: AtomicBool::new(false),
    }
  }

  pub fn last_known_count(&self) -> u64 {
    self.last_known_count.load(Ordering::Acquire)
  }

  /// With selective sync off every refresh is a full reload.
  pub fn set_selective(&self, selective: bool) {
    self.selective.store(selective, Ordering::Release);
  }

  /// One pass without fallback. A failed pass leaves the cache untouched.
  pub async fn sync_pass(&self) -> EngineResult<SyncOutcome> {
    let Some(_flight) = FlightGuard::try_acquire(&self.in_flight) else {
      return Ok(SyncOutcome::Coalesced);
    };
    self.pass().await
  }

  /// Periodic refresh entry point: a pass, and a full reload when the pass
  /// fails.
  pub async fn refresh(&self) -> EngineResult<SyncOutcome> {
    let Some(_flight) = FlightGuard::try_acquire(&self.in_flight) else {
      tracing::debug!("refresh already running, coalescing");
      return Ok(SyncOutcome::Coalesced);
    };

    if !self.selective.load(Ordering::Acquire) {
      let count = self.reload().await?;
      return Ok(SyncOutcome::FullReload { count });
    }

    match self.pass().await {
      Ok(outcome) => Ok(outcome),
      Err(error) => {
        tracing::warn!("selective sync failed ({}), falling back to a full reload", error);
        let count = self.reload().await?;
        Ok(SyncOutcome::FullReload { count })
      }
    }
  }

  /// Replaces the confirmed records covered by a fresh list from the ledger.
  /// Provisional records stay. Coalesces with a pass or reload that is
  /// already running, so two reloads never apply out of order.
  pub async fn full_reload(&self) -> EngineResult<SyncOutcome> {
    let Some(_flight) = FlightGuard::try_acquire(&self.in_flight) else {
      tracing::debug!("sync already running, coalescing full reload");
      return Ok(SyncOutcome::Coalesced);
    };
    let count = self.reload().await?;
    Ok(SyncOutcome::FullReload { count })
  }

  // Callers hold the flight guard.
  async fn reload(&self) -> EngineResult<u64> {
    let (count, proposals) = futures::try_join!(
      with_timeout(self.timeout, self.ledger.get_proposal_count()),
      with_timeout(self.timeout, self.ledger.list_proposals()),
    )?;

    let proposals = Wrapper(proposals).newest_first().0;
    // The list may have been served after a newer block than the count.
    let count = proposals.iter().filter_map(|proposal| proposal.id.confirmed()).max().unwrap_or(0).max(count);

    let resolved = self.cache.replace_confirmed(proposals);
    self.last_known_count.store(count, Ordering::Release);
    self.loader.reset(self.cache.confirmed_len() as u64, Some(count));

    if !resolved.is_empty() {
      tracing::debug!("full reload resolved provisional records {:?}", resolved);
    }
    tracing::info!("full reload: {} proposals cached, count {}", self.cache.len(), count);
    self.events.emit(EngineEvent::CacheChanged);
    Ok(count)
  }

  /// Re-reads one proposal after a write touched it. Returns whether the
  /// cached record changed.
  pub async fn refresh_one(&self, id: u64) -> EngineResult<bool> {
    let generation = self.cache.generation();
    let proposal = with_timeout(self.timeout, self.ledger.get_proposal(id)).await?;
    if proposal.id != ProposalId::Confirmed(id) {
      return Err(EngineError::TransientRead(format!("asked for #{id}, ledger returned {}", proposal.id)));
    }
    if self.cache.fingerprint_of(proposal.id) == Some(proposal.fingerprint()) {
      return Ok(false);
    }

    self.cache.apply_if_current(generation, vec![proposal]).ok_or(EngineError::StaleData)?;
    self.events.emit(EngineEvent::RenderProposal(ProposalId::Confirmed(id)));
    self.events.emit(EngineEvent::CacheChanged);
    Ok(true)
  }

  async fn pass(&self) -> EngineResult<SyncOutcome> {
    let count = with_timeout(self.timeout, self.ledger.get_proposal_count()).await?;
    let last_known = self.last_known_count();

    if count != last_known {
      if count < last_known {
        tracing::warn!("ledger reports {} proposals, fewer than the {} seen before; reloading", count, last_known);
      }
      let count = self.reload().await?;
      return Ok(SyncOutcome::FullReload { count });
    }

    let generation = self.cache.generation();
    let proposals = with_timeout(self.timeout, self.ledger.list_proposals()).await?;
    let changed = self.diff(count, proposals)?;

    let updated: Vec<u64> = changed.iter().filter_map(|proposal| proposal.id.confirmed()).collect();
    if changed.is_empty() {
      return Ok(SyncOutcome::Incremental { updated });
    }

    self.cache.apply_if_current(generation, changed).ok_or(EngineError::StaleData)?;
    for id in &updated {
      self.events.emit(EngineEvent::RenderProposal(ProposalId::Confirmed(*id)));
    }
    self.events.emit(EngineEvent::CacheChanged);

    tracing::debug!("selective sync updated {:?}", updated);
    Ok(SyncOutcome::Incremental { updated })
  }

  /// Records that are new or whose fingerprint moved, newest first. Any
  /// answer that does not fit the cached picture is reported as stale so the
  /// caller reloads instead of patching. Only the listed window, from the
  /// lowest listed id up, is compared.
  fn diff(&self, count: u64, proposals: Vec<Proposal>) -> EngineResult<Vec<Proposal>> {
    let proposals = Wrapper(proposals).newest_first().0;
    if proposals.iter().any(|proposal| proposal.id.is_provisional() || proposal.id > ProposalId::Confirmed(count)) {
      return Err(EngineError::StaleData);
    }

    let floor = match proposals.last() {
      Some(lowest) => lowest.id,
      None if count == 0 => ProposalId::Confirmed(0),
      None => return Err(EngineError::StaleData),
    };
    let listed: HashSet<ProposalId> = proposals.iter().map(|proposal| proposal.id).collect();
    let missing = self.cache.all().into_iter().any(|cached| {
      !cached.id.is_provisional() && cached.id >= floor && !listed.contains(&cached.id)
    });
    if missing {
      return Err(EngineError::StaleData);
    }

    Ok(
      proposals
        .into_iter()
        .filter(|proposal| self.cache.fingerprint_of(proposal.id) != Some(proposal.fingerprint()))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{events::drain, sample_proposal, Address, MockLedger};

  const TIMEOUT: Duration = Duration::from_secs(10);

  #[tokio::test]
  async fn test_only_changed_fingerprints_are_replaced() {
    let (ledger, cache, sync) = get_synchronizer(&[3, 4, 5]);
    ledger.update_proposal(4, |proposal| proposal.approval_count = 1);
    sync.full_reload().await.unwrap();

    let untouched_5 = cache.get(ProposalId::Confirmed(5)).unwrap();
    let untouched_3 = cache.get(ProposalId::Confirmed(3)).unwrap();
    let mut events = sync.events.subscribe();

    ledger.update_proposal(4, |proposal| proposal.approval_count = 2);
    let outcome = sync.sync_pass().await.unwrap();

    assert_eq!(outcome, SyncOutcome::Incremental { updated: vec![4] });
    assert_eq!(cache.get(ProposalId::Confirmed(4)).unwrap().approval_count, 2);
    assert!(Arc::ptr_eq(&untouched_5, &cache.get(ProposalId::Confirmed(5)).unwrap()));
    assert!(Arc::ptr_eq(&untouched_3, &cache.get(ProposalId::Confirmed(3)).unwrap()));
    assert_eq!(
      drain(&mut events),
      vec![EngineEvent::RenderProposal(ProposalId::Confirmed(4)), EngineEvent::CacheChanged]
    );
  }

  #[tokio::test]
  async fn test_unchanged_ledger_emits_nothing() {
    let (_ledger, _cache, sync) = get_synchronizer(&[1, 2]);
    sync.full_reload().await.unwrap();
    let mut events = sync.events.subscribe();

    assert_eq!(sync.sync_pass().await.unwrap(), SyncOutcome::Incremental { updated: vec![] });
    assert!(drain(&mut events).is_empty());
  }

  #[tokio::test]
  async fn test_new_proposals_force_a_full_reload() {
    let (ledger, cache, sync) = get_synchronizer(&[1, 2]);
    sync.full_reload().await.unwrap();
    ledger.push_proposal(sample_proposal(3, 0));

    assert_eq!(sync.sync_pass().await.unwrap(), SyncOutcome::FullReload { count: 3 });
    assert_eq!(sync.last_known_count(), 3);
    assert_eq!(cache.len(), 3);
    assert_eq!(sync.loader.total_count(), Some(3));
    assert_eq!(sync.loader.loaded_count(), 3);
  }

  #[tokio::test]
  async fn test_failed_pass_leaves_cache_untouched() {
    let (ledger, cache, sync) = get_synchronizer(&[1, 2]);
    sync.full_reload().await.unwrap();
    ledger.update_proposal(2, |proposal| proposal.executed = true);
    ledger.fail_next("list_proposals", 1);

    assert!(sync.sync_pass().await.unwrap_err().is_transient());
    assert!(!cache.get(ProposalId::Confirmed(2)).unwrap().executed);
  }

  #[tokio::test]
  async fn test_refresh_falls_back_to_full_reload() {
    let (ledger, cache, sync) = get_synchronizer(&[1, 2]);
    sync.full_reload().await.unwrap();
    ledger.update_proposal(2, |proposal| proposal.executed = true);
    ledger.fail_next("list_proposals", 1);

    assert_eq!(sync.refresh().await.unwrap(), SyncOutcome::FullReload { count: 2 });
    assert!(cache.get(ProposalId::Confirmed(2)).unwrap().executed);
  }

  #[tokio::test]
  async fn test_shrinking_count_is_treated_as_ambiguity() {
    let (_ledger, cache, sync) = get_synchronizer(&[1, 2, 3]);
    sync.full_reload().await.unwrap();

    // Point the synchronizer at a ledger that knows fewer proposals.
    let fresh = Arc::new(MockLedger::new(Address::new("0xme")));
    fresh.push_proposal(sample_proposal(1, 0));
    fresh.push_proposal(sample_proposal(2, 0));
    let sync = SelectiveSynchronizer { ledger: fresh, ..sync };

    assert_eq!(sync.sync_pass().await.unwrap(), SyncOutcome::FullReload { count: 2 });
    assert_eq!(cache.confirmed_len(), 2);
  }

  #[tokio::test]
  async fn test_disabled_selective_sync_always_reloads() {
    let (ledger, _cache, sync) = get_synchronizer(&[1]);
    sync.full_reload().await.unwrap();
    sync.set_selective(false);

    assert_eq!(sync.refresh().await.unwrap(), SyncOutcome::FullReload { count: 1 });
    assert_eq!(ledger.calls("list_proposals"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_overlapping_passes_coalesce() {
    let (ledger, _cache, sync) = get_synchronizer(&[1, 2]);
    ledger.set_latency(Duration::from_millis(100));

    let (a, b) = tokio::join!(sync.refresh(), sync.refresh());
    let outcomes = [a.unwrap(), b.unwrap()];

    assert!(outcomes.contains(&SyncOutcome::Coalesced));
    assert_eq!(ledger.calls("get_proposal_count"), 2);
  }

  #[tokio::test]
  async fn test_passes_converge_with_a_full_reload() {
    let (ledger, cache, sync) = get_synchronizer(&[1, 2, 3, 4]);
    sync.refresh().await.unwrap();

    ledger.update_proposal(1, |proposal| proposal.expired = true);
    sync.refresh().await.unwrap();
    ledger.push_proposal(sample_proposal(5, 1));
    ledger.update_proposal(3, |proposal| proposal.approval_count = 3);
    sync.refresh().await.unwrap();
    ledger.update_proposal(5, |proposal| proposal.rejected = true);
    sync.refresh().await.unwrap();

    let synced: Vec<Proposal> = cache.all().iter().map(|proposal| Proposal::clone(proposal)).collect();
    assert_eq!(synced, ledger.proposals());
  }

  #[tokio::test]
  async fn test_refresh_one_rewrites_a_single_record() {
    let (ledger, cache, sync) = get_synchronizer(&[1, 2]);
    sync.full_reload().await.unwrap();
    let untouched = cache.get(ProposalId::Confirmed(1)).unwrap();

    ledger.update_proposal(2, |proposal| proposal.approval_count = 1);
    assert!(sync.refresh_one(2).await.unwrap());
    assert!(!sync.refresh_one(2).await.unwrap());

    assert_eq!(cache.get(ProposalId::Confirmed(2)).unwrap().approval_count, 1);
    assert!(Arc::ptr_eq(&untouched, &cache.get(ProposalId::Confirmed(1)).unwrap()));
  }

  #[tokio::test]
  async fn test_bounded_list_keeps_paged_in_records() {
    let ids: Vec<u64> = (1 ..= 30).collect();
    let (ledger, cache, sync) = get_synchronizer(&ids);
    ledger.set_list_limit(Some(10));

    sync.full_reload().await.unwrap();
    assert_eq!(cache.len(), 10);
    sync.loader.load_more().await.unwrap();
    assert_eq!(cache.len(), 30);

    assert_eq!(sync.refresh().await.unwrap(), SyncOutcome::Incremental { updated: vec![] });
    assert_eq!(cache.len(), 30);

    ledger.update_proposal(28, |proposal| proposal.approval_count = 1);
    assert_eq!(sync.refresh().await.unwrap(), SyncOutcome::Incremental { updated: vec![28] });

    ledger.push_proposal(sample_proposal(31, 0));
    assert_eq!(sync.refresh().await.unwrap(), SyncOutcome::FullReload { count: 31 });
    assert_eq!(cache.len(), 31);
    assert_eq!(sync.loader.loaded_count(), 31);
    assert!(!sync.loader.has_more());
  }

  #[tokio::test]
  async fn test_bounded_list_missing_a_listed_id_is_stale() {
    let (ledger, cache, sync) = get_synchronizer(&[1, 2, 3, 4]);
    sync.full_reload().await.unwrap();
    cache.put(sample_proposal(9, 0));

    // cached inside the listed window, yet not listed
    assert_eq!(sync.sync_pass().await, Err(EngineError::StaleData));
    cache.remove(ProposalId::Confirmed(9));
    ledger.set_list_limit(Some(2));
    assert_eq!(sync.sync_pass().await.unwrap(), SyncOutcome::Incremental { updated: vec![] });
  }

  #[tokio::test(start_paused = true)]
  async fn test_full_reload_coalesces_with_a_running_refresh() {
    let (ledger, cache, sync) = get_synchronizer(&[1, 2]);
    ledger.set_latency(Duration::from_millis(100));

    let created_later = async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      ledger.push_proposal(sample_proposal(3, 0));
      sync.full_reload().await
    };
    let (refresh, reload) = tokio::join!(sync.refresh(), created_later);

    assert_eq!(refresh.unwrap(), SyncOutcome::FullReload { count: 3 });
    assert_eq!(reload.unwrap(), SyncOutcome::Coalesced);
    assert_eq!(sync.last_known_count(), 3);
    assert_eq!(cache.confirmed_len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_page_read_before_a_full_reload_is_dropped() {
    let (ledger, cache, sync) = get_synchronizer(&[1, 2, 3, 4, 5]);
    ledger.delay_replies(Duration::from_millis(100));

    let reload = async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      ledger.update_proposal(5, |proposal| proposal.approval_count = 2);
      ledger.delay_replies(Duration::ZERO);
      sync.full_reload().await
    };
    let (page, reload) = tokio::join!(sync.loader.load_more(), reload);

    assert_eq!(reload.unwrap(), SyncOutcome::FullReload { count: 5 });
    assert_eq!(page, Err(EngineError::StaleData));
    assert_eq!(cache.get(ProposalId::Confirmed(5)).unwrap().approval_count, 2);
    assert_eq!(sync.loader.loaded_count(), 5);
    assert_eq!(sync.loader.total_count(), Some(5));
  }

  fn get_synchronizer(ids: &[u64]) -> (Arc<MockLedger>, Arc<ProposalCache>, SelectiveSynchronizer) {
    let ledger = Arc::new(MockLedger::new(Address::new("0xme")));
    for id in ids {
      ledger.push_proposal(sample_proposal(*id, 0));
    }
    let cache = Arc::new(ProposalCache::new());
    let events = EventBus::new();
    let loader = Arc::new(IncrementalLoader::new(ledger.clone(), cache.clone(), events.clone(), 20, TIMEOUT));
    let sync = SelectiveSynchronizer::new(ledger.clone(), cache.clone(), loader, events, TIMEOUT);
    (ledger, cache, sync)
  }
}
