use std::{future::Future, sync::Arc};

use tokio::{
  sync::broadcast,
  time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
  Address, BalanceBook, EngineEvent, EngineResult, EventBus, IncrementalLoader, LedgerClient, NotificationSink,
  OptimisticTracker, Proposal, ProposalCache, RawAmount, SelectiveSynchronizer, Settings, TxOrchestrator,
};

/// Owns every engine component and drives the refresh loop.
///
/// Built from an injected ledger client and notification sink; the engine
/// holds no global state, so several engines (for example one per account)
/// can live side by side.
pub struct Engine {
  settings: Settings,
  events: EventBus,
  cache: Arc<ProposalCache>,
  balances: Arc<BalanceBook>,
  loader: Arc<IncrementalLoader>,
  synchronizer: Arc<SelectiveSynchronizer>,
  tracker: Arc<OptimisticTracker>,
  orchestrator: TxOrchestrator,
}

impl Engine {
  pub fn new(settings: Settings, ledger: Arc<dyn LedgerClient>, sink: Arc<dyn NotificationSink>) -> Self {
    let events = EventBus::new();
    let cache = Arc::new(ProposalCache::new());
    let balances = Arc::new(BalanceBook::new(
      ledger.clone(),
      events.clone(),
      settings.account.clone(),
      settings.balance_ttl,
      settings.sync_timeout,
    ));
    let loader = Arc::new(IncrementalLoader::new(
      ledger.clone(),
      cache.clone(),
      events.clone(),
      settings.page_size,
      settings.sync_timeout,
    ));
    let synchronizer = Arc::new(SelectiveSynchronizer::new(
      ledger.clone(),
      cache.clone(),
      loader.clone(),
      events.clone(),
      settings.sync_timeout,
    ));
    let tracker = Arc::new(OptimisticTracker::new(
      ledger.clone(),
      cache.clone(),
      synchronizer.clone(),
      events.clone(),
      &settings,
    ));
    let orchestrator = TxOrchestrator::new(
      ledger,
      cache.clone(),
      balances.clone(),
      synchronizer.clone(),
      tracker.clone(),
      events.clone(),
      sink,
      &settings,
    );

    Self { settings, events, cache, balances, loader, synchronizer, tracker, orchestrator }
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe()
  }

  pub fn cache(&self) -> &ProposalCache {
    &self.cache
  }

  pub fn balances(&self) -> &BalanceBook {
    &self.balances
  }

  pub fn loader(&self) -> &IncrementalLoader {
    &self.loader
  }

  pub fn synchronizer(&self) -> &SelectiveSynchronizer {
    &self.synchronizer
  }

  pub fn tracker(&self) -> &OptimisticTracker {
    &self.tracker
  }

  pub fn orchestrator(&self) -> &TxOrchestrator {
    &self.orchestrator
  }

  /// The proposal list as the UI shows it, newest first.
  pub fn proposals(&self) -> Vec<Arc<Proposal>> {
    self.cache.all()
  }

  /// Parses a user-entered amount with the token's decimals.
  pub async fn parse_amount(&self, token: &Address, input: &str) -> EngineResult<RawAmount> {
    let snapshot = self.balances.snapshot(token).await?;
    RawAmount::parse_units(input, snapshot.decimals)
  }

  /// Initial load: every proposal plus the balances of each tracked token.
  pub async fn start(&self) -> EngineResult<()> {
    let outcome = self.synchronizer.full_reload().await?;
    tracing::info!("engine started for {} ({:?}, {} proposals cached)", self.settings.account, outcome, self.cache.len());
    self.refresh_balances().await;
    Ok(())
  }

  /// Refreshes on every interval tick until `shutdown` resolves. A failed
  /// tick is logged and the next one runs as usual.
  pub async fn run(&self, shutdown: impl Future<Output = ()>) {
    let period = self.settings.refresh_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        () = &mut shutdown => break,
        _ = ticker.tick() => {
          match self.synchronizer.refresh().await {
            Ok(outcome) => tracing::debug!("refresh tick: {:?}", outcome),
            Err(error) => tracing::warn!("refresh tick failed: {}", error),
          }
          self.refresh_balances().await;
        }
      }
    }
    tracing::info!("refresh loop stopped");
  }

  async fn refresh_balances(&self) {
    for token in &self.settings.tokens {
      if let Err(error) = self.balances.refresh(token).await {
        tracing::warn!("reading balances of {} failed: {}", token, error);
      }
    }
  }
}
