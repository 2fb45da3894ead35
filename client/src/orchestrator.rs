use std::{collections::HashMap, sync::Arc, time::Duration};

use derive_more::Display;
use parking_lot::Mutex;

use crate::{
  util::await_receipt, Address, BalanceBook, Confirmation, EngineError, EngineEvent, EngineResult, EventBus,
  LedgerClient, Notification, NotificationSink, OptimisticTracker, PhaseTransition, ProposalAction, ProposalCache,
  ProposalId, RawAmount, Receipt, SelectiveSynchronizer, Settings, Transaction, TxHash,
};

/// The write flows the orchestrator runs. At most one of each kind is in
/// flight at a time.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
  #[display("approve spend")]
  ApproveSpend,
  #[display("stake")]
  Stake,
  #[display("unstake")]
  Unstake,
  #[display("claim rewards")]
  Claim,
  #[display("create proposal")]
  CreateProposal,
  #[display("approve proposal")]
  ApproveProposal,
  #[display("reject proposal")]
  RejectProposal,
  #[display("execute proposal")]
  ExecuteProposal,
}

#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
  #[default]
  Idle,
  /// The slot is taken and pre-flight checks (balances, allowance, a chained
  /// spend approval) are running; nothing of this kind was submitted yet.
  Preparing,
  /// Waiting for the user to sign in the wallet.
  AwaitingUserConfirmation,
  /// Submitted, waiting for the ledger to include it.
  Processing,
}

type Slots = Mutex<HashMap<OperationKind, Phase>>;

/// Holds the slot of one operation kind. Dropping it frees the slot and
/// moves the phase back to `Idle`, whichever way the operation ended.
struct Execution<'a> {
  slots: &'a Slots,
  events: &'a EventBus,
  kind: OperationKind,
}

impl<'a> Execution<'a> {
  fn begin(slots: &'a Slots, events: &'a EventBus, kind: OperationKind) -> EngineResult<Self> {
    let mut taken = slots.lock();
    if taken.contains_key(&kind) {
      tracing::debug!("{} already in flight, rejecting duplicate", kind);
      return Err(EngineError::AlreadyInFlight(kind));
    }
    taken.insert(kind, Phase::Preparing);
    drop(taken);

    let execution = Self { slots, events, kind };
    execution.transition(Phase::Idle, Phase::Preparing);
    Ok(execution)
  }

  fn advance(&self, to: Phase) {
    let from = self.slots.lock().insert(self.kind, to).unwrap_or_default();
    self.transition(from, to);
  }

  fn transition(&self, from: Phase, to: Phase) {
    if from != to {
      tracing::debug!("{}: {} -> {}", self.kind, from, to);
      self.events.emit(EngineEvent::Phase(PhaseTransition { kind: self.kind, from, to }));
    }
  }
}

impl Drop for Execution<'_> {
  fn drop(&mut self) {
    let from = self.slots.lock().remove(&self.kind).unwrap_or_default();
    self.transition(from, Phase::Idle);
  }
}

/// Runs user-initiated writes: pre-flight checks, the signing prompt,
/// submission and confirmation, then the cache and balance updates that
/// follow a confirmed write.
///
/// Every operation that gets past the duplicate guard ends with exactly one
/// notification. Nothing is retried automatically.
pub struct TxOrchestrator {
  ledger: Arc<dyn LedgerClient>,
  cache: Arc<ProposalCache>,
  balances: Arc<BalanceBook>,
  synchronizer: Arc<SelectiveSynchronizer>,
  tracker: Arc<OptimisticTracker>,
  events: EventBus,
  sink: Arc<dyn NotificationSink>,
  account: Address,
  staking_contract: Address,
  confirm_timeout: Duration,
  slots: Slots,
}

impl TxOrchestrator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    ledger: Arc<dyn LedgerClient>,
    cache: Arc<ProposalCache>,
    balances: Arc<BalanceBook>,
    synchronizer: Arc<SelectiveSynchronizer>,
    tracker: Arc<OptimisticTracker>,
    events: EventBus,
    sink: Arc<dyn NotificationSink>,
    settings: &Settings,
  ) -> Self {
    Self {
      ledger,
      cache,
      balances,
      synchronizer,
      tracker,
      events,
      sink,
      account: settings.account.clone(),
      staking_contract: settings.staking_contract.clone(),
      confirm_timeout: settings.confirm_timeout,
      slots: Mutex::new(HashMap::new()),
    }
  }

  pub fn phase(&self, kind: OperationKind) -> Phase {
    self.slots.lock().get(&kind).copied().unwrap_or_default()
  }

  /// Lets the staking contract spend `amount` of `token`.
  pub async fn approve_spend(&self, token: &Address, amount: RawAmount) -> EngineResult<Receipt> {
    let kind = OperationKind::ApproveSpend;
    let execution = self.begin(kind)?;
    let result = self.run_approve(&execution, token, amount).await;
    self.report(kind, &result, |_| {
      Notification::success("Spending approved", format!("The staking contract may now spend {amount} of {token}."))
    });
    result
  }

  /// Stakes `amount` of `token`, approving the spend first when the current
  /// allowance does not cover it.
  pub async fn stake(&self, token: &Address, amount: RawAmount) -> EngineResult<Receipt> {
    let kind = OperationKind::Stake;
    let execution = self.begin(kind)?;
    let mut approved = false;
    let result = self.run_stake(&execution, token, amount, &mut approved).await;

    match &result {
      Err(error) if approved => self.sink.notify(Notification::failure(
        error.title(),
        format!("The spending approval went through, but staking failed. {}", error.user_message()),
      )),
      _ => self.report(kind, &result, |(receipt, decimals)| {
        Notification::success(
          "Stake confirmed",
          format!("Staked {} in block {}.", amount.format_units(*decimals), receipt.block_number),
        )
      }),
    }
    result.map(|(receipt, _)| receipt)
  }

  pub async fn unstake(&self, token: &Address, amount: RawAmount) -> EngineResult<Receipt> {
    let kind = OperationKind::Unstake;
    let execution = self.begin(kind)?;
    let result = self.run_unstake(&execution, token, amount).await;
    self.report(kind, &result, |(receipt, decimals)| {
      Notification::success(
        "Unstake confirmed",
        format!("Unstaked {} in block {}.", amount.format_units(*decimals), receipt.block_number),
      )
    });
    result.map(|(receipt, _)| receipt)
  }

  pub async fn claim(&self, token: &Address) -> EngineResult<Receipt> {
    let kind = OperationKind::Claim;
    let execution = self.begin(kind)?;
    let result = self.run_claim(&execution, token).await;
    self.report(kind, &result, |(_, claimed)| Notification::success("Rewards claimed", format!("Claimed {claimed}.")));
    result.map(|(receipt, _)| receipt)
  }

  /// Submits a new proposal. It shows up as a provisional record as soon as
  /// the ledger accepts the transaction.
  pub async fn create_proposal(&self, action: ProposalAction) -> EngineResult<Confirmation> {
    let kind = OperationKind::CreateProposal;
    let execution = self.begin(kind)?;
    let result = self.run_create(&execution, action).await;
    self.report(kind, &result, |confirmation| match confirmation {
      Confirmation::Reconciled(id) => {
        Notification::success("Proposal created", format!("Proposal #{id} is open for approvals."))
      }
      Confirmation::Linked(id) => {
        Notification::success("Proposal created", format!("Proposal #{id} will appear with the next refresh."))
      }
      Confirmation::Ignored => Notification::success("Proposal created", "The proposal was confirmed."),
    });
    result
  }

  pub async fn approve_proposal(&self, id: u64) -> EngineResult<Receipt> {
    self.vote(OperationKind::ApproveProposal, id).await
  }

  pub async fn reject_proposal(&self, id: u64) -> EngineResult<Receipt> {
    self.vote(OperationKind::RejectProposal, id).await
  }

  pub async fn execute_proposal(&self, id: u64) -> EngineResult<Receipt> {
    let kind = OperationKind::ExecuteProposal;
    let execution = self.begin(kind)?;
    let result = self.run_execute(&execution, id).await;
    self.report(kind, &result, |_| Notification::success("Proposal executed", format!("Proposal #{id} was executed.")));
    result
  }

  async fn vote(&self, kind: OperationKind, id: u64) -> EngineResult<Receipt> {
    let execution = self.begin(kind)?;
    let result = self.run_vote(&execution, id).await;
    self.report(kind, &result, |_| {
      let verb = if kind == OperationKind::ApproveProposal { "approved" } else { "rejected" };
      Notification::success("Vote recorded", format!("You {verb} proposal #{id}."))
    });
    result
  }

  async fn run_approve(&self, execution: &Execution<'_>, token: &Address, amount: RawAmount) -> EngineResult<Receipt> {
    if amount.is_zero() {
      return Err(EngineError::InvalidInput("Enter an amount greater than zero.".to_string()));
    }
    let tx = Transaction::Approve { token: token.clone(), spender: self.staking_contract.clone(), amount };
    self.execute(execution, tx).await
  }

  async fn run_stake(
    &self,
    execution: &Execution<'_>,
    token: &Address,
    amount: RawAmount,
    approved: &mut bool,
  ) -> EngineResult<(Receipt, u32)> {
    if amount.is_zero() {
      return Err(EngineError::InvalidInput("Enter an amount greater than zero.".to_string()));
    }
    let snapshot = self.balances.snapshot(token).await?;
    if snapshot.available < amount {
      return Err(EngineError::InsufficientFunds);
    }

    if self.balances.allowance(token, &self.staking_contract).await? < amount {
      tracing::info!("allowance for {} below {}, approving first", token, amount);
      let approval = self.begin(OperationKind::ApproveSpend)?;
      self.run_approve(&approval, token, amount).await?;
      drop(approval);
      *approved = true;

      if self.balances.allowance(token, &self.staking_contract).await? < amount {
        return Err(EngineError::InsufficientAllowance);
      }
    }

    let receipt = self.execute(execution, Transaction::Stake { token: token.clone(), amount }).await?;
    self.after_balance_write(token).await;
    Ok((receipt, snapshot.decimals))
  }

  async fn run_unstake(
    &self,
    execution: &Execution<'_>,
    token: &Address,
    amount: RawAmount,
  ) -> EngineResult<(Receipt, u32)> {
    if amount.is_zero() {
      return Err(EngineError::InvalidInput("Enter an amount greater than zero.".to_string()));
    }
    let snapshot = self.balances.snapshot(token).await?;
    if snapshot.staked < amount {
      return Err(EngineError::InsufficientFunds);
    }

    let receipt = self.execute(execution, Transaction::Unstake { token: token.clone(), amount }).await?;
    self.after_balance_write(token).await;
    Ok((receipt, snapshot.decimals))
  }

  async fn run_claim(&self, execution: &Execution<'_>, token: &Address) -> EngineResult<(Receipt, String)> {
    let snapshot = self.balances.snapshot(token).await?;
    if snapshot.pending_rewards.is_zero() {
      return Err(EngineError::InvalidInput("There are no rewards to claim yet.".to_string()));
    }

    let receipt = self.execute(execution, Transaction::Claim { token: token.clone() }).await?;
    self.after_balance_write(token).await;
    Ok((receipt, snapshot.display_pending_rewards()))
  }

  async fn run_create(&self, execution: &Execution<'_>, action: ProposalAction) -> EngineResult<Confirmation> {
    if !action.is_submittable() {
      return Err(EngineError::InvalidInput("This proposal type cannot be submitted.".to_string()));
    }

    let hash = self.send(execution, Transaction::CreateProposal { action: action.clone() }).await?;
    let provisional = self.tracker.insert_provisional(action, hash.clone());
    self.tracker.track_confirmation(provisional, &hash).await
  }

  async fn run_vote(&self, execution: &Execution<'_>, id: u64) -> EngineResult<Receipt> {
    if let Some(proposal) = self.cache.get(ProposalId::Confirmed(id)) {
      if proposal.proposer.matches(&self.account) {
        return Err(EngineError::InvalidInput("You cannot vote on your own proposal.".to_string()));
      }
      if !proposal.can_vote(&self.account) {
        return Err(EngineError::InvalidInput(format!("Proposal #{id} is {}.", proposal.lifecycle())));
      }
    }

    let tx = match execution.kind {
      OperationKind::RejectProposal => Transaction::RejectProposal { id },
      _ => Transaction::ApproveProposal { id },
    };
    let receipt = self.execute(execution, tx).await?;
    self.after_proposal_write(id).await;
    Ok(receipt)
  }

  async fn run_execute(&self, execution: &Execution<'_>, id: u64) -> EngineResult<Receipt> {
    if let Some(proposal) = self.cache.get(ProposalId::Confirmed(id)) {
      if proposal.lifecycle() != crate::LifecycleState::Approved {
        return Err(EngineError::InvalidInput(format!("Proposal #{id} is {}.", proposal.lifecycle())));
      }
    }

    let receipt = self.execute(execution, Transaction::ExecuteProposal { id }).await?;
    self.after_proposal_write(id).await;
    Ok(receipt)
  }

  async fn send(&self, execution: &Execution<'_>, tx: Transaction) -> EngineResult<TxHash> {
    execution.advance(Phase::AwaitingUserConfirmation);
    let hash = self.ledger.submit(&tx).await?;
    execution.advance(Phase::Processing);
    tracing::info!("{} submitted as {}", execution.kind, hash);
    Ok(hash)
  }

  async fn execute(&self, execution: &Execution<'_>, tx: Transaction) -> EngineResult<Receipt> {
    let hash = self.send(execution, tx).await?;
    let receipt = await_receipt(self.ledger.as_ref(), &hash, self.confirm_timeout).await?;
    tracing::info!("{} confirmed in block {}", execution.kind, receipt.block_number);
    Ok(receipt)
  }

  // The write is confirmed at this point; a failed re-read is only logged.
  async fn after_balance_write(&self, token: &Address) {
    if let Err(error) = self.balances.refresh(token).await {
      tracing::warn!("refreshing balances of {} failed: {}", token, error);
    }
  }

  async fn after_proposal_write(&self, id: u64) {
    if let Err(error) = self.synchronizer.refresh_one(id).await {
      tracing::warn!("refreshing proposal #{} failed: {}", id, error);
    }
  }

  fn begin(&self, kind: OperationKind) -> EngineResult<Execution<'_>> {
    Execution::begin(&self.slots, &self.events, kind)
  }

  fn report<T>(&self, kind: OperationKind, result: &EngineResult<T>, success: impl FnOnce(&T) -> Notification) {
    let notification = match result {
      Ok(value) => success(value),
      Err(error) => {
        tracing::warn!("{} failed: {}", kind, error);
        Notification::failure(error.title(), format!("Could not {kind}. {}", error.user_message()))
      }
    };
    self.sink.notify(notification);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    events::{drain, RecordingSink},
    sample_proposal, ConfirmOutcome, IncrementalLoader, LedgerError, MockLedger, NotificationKind,
  };

  struct Harness {
    ledger: Arc<MockLedger>,
    cache: Arc<ProposalCache>,
    sink: Arc<RecordingSink>,
    orchestrator: TxOrchestrator,
    token: Address,
  }

  #[tokio::test]
  async fn test_stake_approves_first_when_allowance_is_short() {
    let harness = get_harness();
    harness.ledger.set_balance(&harness.token, RawAmount(100));
    let mut events = harness.orchestrator.events.subscribe();

    harness.orchestrator.stake(&harness.token, RawAmount(10)).await.unwrap();

    let phases: Vec<(OperationKind, Phase, Phase)> = drain(&mut events)
      .into_iter()
      .filter_map(|event| match event {
        EngineEvent::Phase(PhaseTransition { kind, from, to }) => Some((kind, from, to)),
        _ => None,
      })
      .collect();
    use OperationKind::{ApproveSpend, Stake};
    use Phase::{AwaitingUserConfirmation as Awaiting, Idle, Preparing, Processing};
    assert_eq!(
      phases,
      vec![
        (Stake, Idle, Preparing),
        (ApproveSpend, Idle, Preparing),
        (ApproveSpend, Preparing, Awaiting),
        (ApproveSpend, Awaiting, Processing),
        (ApproveSpend, Processing, Idle),
        (Stake, Preparing, Awaiting),
        (Stake, Awaiting, Processing),
        (Stake, Processing, Idle),
      ]
    );

    let submitted = harness.ledger.submitted();
    assert!(matches!(submitted[0], Transaction::Approve { amount: RawAmount(10), .. }));
    assert!(matches!(submitted[1], Transaction::Stake { amount: RawAmount(10), .. }));

    let notifications = harness.sink.take();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Success);
    assert_eq!(harness.orchestrator.phase(Stake), Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stake_slot_is_busy_during_chained_approval() {
    let harness = get_harness();
    harness.ledger.set_balance(&harness.token, RawAmount(100));
    harness.ledger.set_latency(Duration::from_millis(10));

    let orchestrator = &harness.orchestrator;
    let staking = orchestrator.stake(&harness.token, RawAmount(10));
    let observer = async {
      while orchestrator.phase(OperationKind::ApproveSpend) != Phase::Processing {
        tokio::time::sleep(Duration::from_millis(1)).await;
      }
      orchestrator.phase(OperationKind::Stake)
    };
    let (staked, stake_phase) = tokio::join!(staking, observer);

    staked.unwrap();
    assert_eq!(stake_phase, Phase::Preparing);
    assert_eq!(orchestrator.phase(OperationKind::Stake), Phase::Idle);
  }

  #[tokio::test]
  async fn test_rejected_approval_never_stakes() {
    let harness = get_harness();
    harness.ledger.set_balance(&harness.token, RawAmount(100));
    harness.ledger.script_submit(Err(LedgerError::UserRejected));

    let result = harness.orchestrator.stake(&harness.token, RawAmount(10)).await;

    assert_eq!(result, Err(EngineError::UserRejected));
    assert_eq!(harness.ledger.submitted().len(), 1);
    assert!(matches!(harness.ledger.submitted()[0], Transaction::Approve { .. }));
    let notifications = harness.sink.take();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].title, "Request rejected");
  }

  #[tokio::test]
  async fn test_sufficient_allowance_skips_approval() {
    let harness = get_harness();
    harness.ledger.set_balance(&harness.token, RawAmount(100));
    harness.ledger.set_allowance(&harness.token, &Address::new("0xstaking"), RawAmount(50));

    harness.orchestrator.stake(&harness.token, RawAmount(50)).await.unwrap();

    assert_eq!(harness.ledger.submitted().len(), 1);
    assert!(matches!(harness.ledger.submitted()[0], Transaction::Stake { .. }));
  }

  #[tokio::test]
  async fn test_partial_success_is_reported() {
    let harness = get_harness();
    harness.ledger.set_balance(&harness.token, RawAmount(100));
    harness.ledger.script_submit(Ok(()));
    harness.ledger.script_submit(Ok(()));
    harness.ledger.script_confirmation(ConfirmOutcome::Confirmed);
    harness.ledger.script_confirmation(ConfirmOutcome::Reverted("staking paused".to_string()));

    let result = harness.orchestrator.stake(&harness.token, RawAmount(10)).await;

    assert_eq!(result, Err(EngineError::ContractRevert("staking paused".to_string())));
    let notifications = harness.sink.take();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].message.contains("approval went through"));
    assert!(notifications[0].message.contains("staking paused"));
  }

  #[tokio::test]
  async fn test_insufficient_balance_submits_nothing() {
    let harness = get_harness();
    harness.ledger.set_balance(&harness.token, RawAmount(5));

    let result = harness.orchestrator.stake(&harness.token, RawAmount(10)).await;

    assert_eq!(result, Err(EngineError::InsufficientFunds));
    assert!(harness.ledger.submitted().is_empty());
    assert_eq!(harness.sink.take().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_double_claim_writes_once() {
    let harness = get_harness();
    harness.ledger.set_rewards(&harness.token, RawAmount(7));
    harness.ledger.set_latency(Duration::from_millis(10));

    let (first, second) =
      tokio::join!(harness.orchestrator.claim(&harness.token), harness.orchestrator.claim(&harness.token));

    assert!(first.is_ok());
    assert_eq!(second, Err(EngineError::AlreadyInFlight(OperationKind::Claim)));
    assert_eq!(harness.ledger.submitted().len(), 1);
    assert_eq!(harness.sink.take().len(), 1);
    assert_eq!(harness.orchestrator.phase(OperationKind::Claim), Phase::Idle);
  }

  #[tokio::test]
  async fn test_claim_without_rewards_is_rejected() {
    let harness = get_harness();

    let result = harness.orchestrator.claim(&harness.token).await;

    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    assert!(harness.ledger.submitted().is_empty());
  }

  #[tokio::test]
  async fn test_balances_are_refreshed_after_unstake() {
    let harness = get_harness();
    harness.ledger.set_staked(&harness.token, RawAmount(40));
    harness.ledger.set_decimals(&harness.token, 1);

    harness.orchestrator.unstake(&harness.token, RawAmount(15)).await.unwrap();

    let snapshot = harness.orchestrator.balances.snapshot(&harness.token).await.unwrap();
    assert_eq!(snapshot.staked, RawAmount(25));
    assert_eq!(snapshot.available, RawAmount(15));
    assert_eq!(harness.sink.take()[0].message, "Unstaked 1.5 in block 1.");
  }

  #[tokio::test(start_paused = true)]
  async fn test_created_proposal_is_visible_before_confirmation() {
    let harness = get_harness();
    harness.ledger.push_proposal(sample_proposal(1, 0));
    harness.ledger.set_latency(Duration::from_millis(10));
    let action = ProposalAction::AddPair { token_a: Address::new("0xa"), token_b: Address::new("0xb"), weight: 5 };

    let orchestrator = &harness.orchestrator;
    let cache = &harness.cache;
    let creation = orchestrator.create_proposal(action.clone());
    let observer = async {
      while orchestrator.phase(OperationKind::CreateProposal) != Phase::Processing {
        tokio::time::sleep(Duration::from_millis(1)).await;
      }
      while !cache.contains(ProposalId::Provisional(1)) {
        tokio::time::sleep(Duration::from_millis(1)).await;
      }
      cache.get(ProposalId::Provisional(1)).unwrap()
    };
    let (confirmation, provisional) = tokio::join!(creation, observer);

    assert!(provisional.is_optimistic);
    assert_eq!(provisional.action, action);
    assert_eq!(confirmation.unwrap(), Confirmation::Reconciled(2));
    assert!(!cache.contains(ProposalId::Provisional(1)));
    assert_eq!(cache.get(ProposalId::Confirmed(2)).unwrap().action, action);
    assert_eq!(harness.sink.take()[0].message, "Proposal #2 is open for approvals.");
  }

  #[tokio::test]
  async fn test_self_vote_is_refused() {
    let harness = get_harness();
    let own = crate::Proposal { proposer: Address::new("0xME"), ..sample_proposal(3, 0) };
    harness.cache.put(own);

    let result = harness.orchestrator.approve_proposal(3).await;

    assert!(matches!(result, Err(EngineError::InvalidInput(message)) if message.contains("own proposal")));
    assert!(harness.ledger.submitted().is_empty());
  }

  #[tokio::test]
  async fn test_vote_refreshes_the_proposal() {
    let harness = get_harness();
    harness.ledger.push_proposal(sample_proposal(3, 1));
    harness.cache.put(sample_proposal(3, 1));

    harness.orchestrator.approve_proposal(3).await.unwrap();

    assert_eq!(harness.cache.get(ProposalId::Confirmed(3)).unwrap().approval_count, 2);
    assert_eq!(harness.sink.take()[0].message, "You approved proposal #3.");
  }

  #[tokio::test]
  async fn test_execute_requires_enough_approvals() {
    let harness = get_harness();
    harness.cache.put(sample_proposal(4, 1));

    assert!(matches!(harness.orchestrator.execute_proposal(4).await, Err(EngineError::InvalidInput(_))));

    harness.ledger.push_proposal(sample_proposal(4, 3));
    harness.cache.put(sample_proposal(4, 3));
    harness.orchestrator.execute_proposal(4).await.unwrap();
    assert!(harness.cache.get(ProposalId::Confirmed(4)).unwrap().executed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unconfirmed_write_times_out() {
    let harness = get_harness();
    harness.ledger.set_rewards(&harness.token, RawAmount(7));
    harness.ledger.script_confirmation(ConfirmOutcome::Never);

    assert_eq!(harness.orchestrator.claim(&harness.token).await, Err(EngineError::Timeout));
    assert_eq!(harness.orchestrator.phase(OperationKind::Claim), Phase::Idle);
    assert_eq!(harness.sink.take()[0].title, "Timed out");
  }

  fn get_harness() -> Harness {
    let ledger = Arc::new(MockLedger::new(Address::new("0xme")));
    let settings = Settings::new(Address::new("0xme"), Address::new("0xstaking"));
    let cache = Arc::new(ProposalCache::new());
    let events = EventBus::new();
    let sink = Arc::new(RecordingSink::default());

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
      loader,
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
    let balances = Arc::new(BalanceBook::new(
      ledger.clone(),
      events.clone(),
      settings.account.clone(),
      settings.balance_ttl,
      settings.sync_timeout,
    ));
    let orchestrator = TxOrchestrator::new(
      ledger.clone(),
      cache.clone(),
      balances,
      synchronizer,
      tracker,
      events,
      sink.clone(),
      &settings,
    );

    Harness { ledger, cache, sink, orchestrator, token: Address::new("0xstake") }
  }
}
