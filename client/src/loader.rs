use std::{
  sync::{atomic::AtomicBool, Arc},
  time::Duration,
};

use derive_more::Display;
use futures::future::join_all;
use parking_lot::Mutex;

use crate::{
  util::{with_timeout, FlightGuard},
  EngineError, EngineEvent, EngineResult, EventBus, LedgerClient, Proposal, ProposalCache, ProposalId, Wrapper,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
  #[display("offset")]
  Offset,
  #[display("gap-fill")]
  GapFill,
  /// Another load was already running; nothing was read.
  #[display("coalesced")]
  Coalesced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
  pub strategy: LoadStrategy,
  /// Ids read in this load, newest first.
  pub loaded_ids: Vec<u64>,
}

#[derive(Debug, Default)]
struct Progress {
  loaded: u64,
  total: Option<u64>,
}

/// Pages older proposals into the cache ("load more").
///
/// Offset paging is tried first. When the paged call fails or the endpoint
/// does not offer it, ids below the lowest cached one are read individually.
/// Either way the batch is merged id-descending by id, so loading a page
/// twice never duplicates an id. A batch read before a full reload is
/// dropped when it arrives, and progress is left as the reload set it.
pub struct IncrementalLoader {
  ledger: Arc<dyn LedgerClient>,
  cache: Arc<ProposalCache>,
  events: EventBus,
  page_size: u64,
  read_timeout: Duration,
  progress: Mutex<Progress>,
  in_flight: AtomicBool,
}

impl IncrementalLoader {
  pub fn new(
    ledger: Arc<dyn LedgerClient>,
    cache: Arc<ProposalCache>,
    events: EventBus,
    page_size: u64,
    read_timeout: Duration,
  ) -> Self {
    Self {
      ledger,
      cache,
      events,
      page_size: page_size.max(1),
      read_timeout,
      progress: Mutex::new(Progress::default()),
      in_flight: AtomicBool::new(false),
    }
  }

  pub fn loaded_count(&self) -> u64 {
    self.progress.lock().loaded
  }

  pub fn total_count(&self) -> Option<u64> {
    self.progress.lock().total
  }

  /// With an unknown total, more is assumed to exist.
  pub fn has_more(&self) -> bool {
    if self.cache.lowest_confirmed_id() == Some(1) {
      return false;
    }
    let progress = self.progress.lock();
    match progress.total {
      None | Some(0) => true,
      Some(total) => progress.loaded < total,
    }
  }

  /// Called after a full reload replaced the cache.
  pub fn reset(&self, loaded: u64, total: Option<u64>) {
    *self.progress.lock() = Progress { loaded, total };
  }

  pub async fn load_more(&self) -> EngineResult<LoadOutcome> {
    let Some(_flight) = FlightGuard::try_acquire(&self.in_flight) else {
      tracing::debug!("load_more already running, coalescing");
      return Ok(LoadOutcome { strategy: LoadStrategy::Coalesced, loaded_ids: Vec::new() });
    };

    let generation = self.cache.generation();
    let skip = self.loaded_count();
    let (strategy, proposals) =
      match with_timeout(self.read_timeout, self.ledger.list_proposals_paged(skip, self.page_size)).await {
        Ok(page) => (LoadStrategy::Offset, page),
        Err(error) => {
          tracing::warn!("paged proposal load failed ({}), falling back to gap-fill", error);
          (LoadStrategy::GapFill, self.gap_fill().await?)
        }
      };

    let received = proposals.len() as u64;
    let proposals = Wrapper(proposals).newest_first().0;
    let loaded_ids: Vec<u64> = proposals.iter().filter_map(|proposal| proposal.id.confirmed()).collect();
    let Some(fresh) = self.merge(generation, proposals) else {
      tracing::warn!("proposals reloaded while a {} page was in flight, page dropped", strategy);
      return Err(EngineError::StaleData);
    };
    match strategy {
      LoadStrategy::Offset => self.advance_offset(received),
      _ => self.progress.lock().loaded += fresh,
    }

    tracing::info!("loaded {} proposals via {} ({} new)", loaded_ids.len(), strategy, fresh);
    Ok(LoadOutcome { strategy, loaded_ids })
  }

  fn advance_offset(&self, received: u64) {
    let mut progress = self.progress.lock();
    progress.loaded += received;
    // A short page means the end of the sequence.
    if received < self.page_size {
      progress.total = Some(progress.loaded);
    }
  }

  /// Reads one page worth of ids below the lowest cached id, skipping ids
  /// already cached. Individual failures are dropped.
  async fn gap_fill(&self) -> EngineResult<Vec<Proposal>> {
    let start = match self.cache.lowest_confirmed_id() {
      Some(lowest) => lowest.saturating_sub(1),
      None => with_timeout(self.read_timeout, self.ledger.get_proposal_count()).await?,
    };
    if start == 0 {
      return Ok(Vec::new());
    }

    let floor = start.saturating_sub(self.page_size - 1).max(1);
    let ids: Vec<u64> =
      (floor ..= start).rev().filter(|id| !self.cache.contains(ProposalId::Confirmed(*id))).collect();
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    let reads = ids.iter().map(|id| with_timeout(self.read_timeout, self.ledger.get_proposal(*id)));
    let results = join_all(reads).await;

    let mut proposals = Vec::with_capacity(ids.len());
    for (id, result) in ids.iter().zip(results) {
      match result {
        Ok(proposal) if proposal.id == ProposalId::Confirmed(*id) => proposals.push(proposal),
        Ok(proposal) => tracing::warn!("gap-fill read for #{} returned {}, dropped", id, proposal.id),
        Err(error) => tracing::debug!("gap-fill read for #{} failed: {}", id, error),
      }
    }

    if proposals.is_empty() {
      return Err(EngineError::TransientRead(format!("none of proposals #{floor}..=#{start} could be read")));
    }
    Ok(proposals)
  }

  /// Writes the records that are new or changed, unless the cache was
  /// reloaded since `generation`. Returns how many ids were new to the cache.
  fn merge(&self, generation: u64, proposals: Vec<Proposal>) -> Option<u64> {
    let mut fresh = 0;
    let mut changed = Vec::new();
    for proposal in proposals.into_iter().filter(|proposal| !proposal.id.is_provisional()) {
      let previous = self.cache.fingerprint_of(proposal.id);
      if previous.is_none() {
        fresh += 1;
      }
      if previous != Some(proposal.fingerprint()) {
        changed.push(proposal);
      }
    }

    let ids: Vec<ProposalId> = changed.iter().map(|proposal| proposal.id).collect();
    self.cache.apply_if_current(generation, changed)?;
    for id in &ids {
      self.events.emit(EngineEvent::RenderProposal(*id));
    }
    if !ids.is_empty() {
      self.events.emit(EngineEvent::CacheChanged);
    }
    Some(fresh)
  }
}
