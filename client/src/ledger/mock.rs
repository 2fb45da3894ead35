use std::{
  collections::{BTreeMap, HashMap, HashSet, VecDeque},
  time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
  Address, LedgerClient, LedgerError, Proposal, ProposalAction, ProposalId, RawAmount, Receipt, Transaction, TxHash,
};

/// How the mock answers the next `wait_for_confirmation`.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
  Confirmed,
  Reverted(String),
  Failed(LedgerError),
  /// Never resolves; for exercising timeouts.
  Never,
}

/// In-memory ledger for tests. Reads return the current state, writes are
/// applied on confirmation, and failures can be scripted per method.
pub struct MockLedger {
  owner: Address,
  state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
  proposals: BTreeMap<u64, Proposal>,
  paged_available: bool,
  failures: HashMap<&'static str, usize>,
  unreadable: HashSet<u64>,
  calls: HashMap<&'static str, usize>,
  latency: Duration,
  reply_delay: Duration,
  list_limit: Option<usize>,
  balances: HashMap<Address, RawAmount>,
  staked: HashMap<Address, RawAmount>,
  rewards: HashMap<Address, RawAmount>,
  allowances: HashMap<(Address, Address), RawAmount>,
  decimals: HashMap<Address, u32>,
  submit_script: VecDeque<Result<(), LedgerError>>,
  confirm_script: VecDeque<ConfirmOutcome>,
  omit_proposal_id: bool,
  submitted: Vec<Transaction>,
  in_flight: HashMap<TxHash, Transaction>,
  blocks: u64,
}

impl MockLedger {
  pub fn new(owner: Address) -> Self {
    Self { owner, state: Mutex::new(MockState { paged_available: true, ..MockState::default() }) }
  }

  pub fn owner(&self) -> &Address {
    &self.owner
  }

  pub fn push_proposal(&self, proposal: Proposal) {
    if let ProposalId::Confirmed(id) = proposal.id {
      self.state.lock().proposals.insert(id, proposal);
    }
  }

  pub fn update_proposal(&self, id: u64, update: impl FnOnce(&mut Proposal)) {
    if let Some(proposal) = self.state.lock().proposals.get_mut(&id) {
      update(proposal);
    }
  }

  pub fn proposals(&self) -> Vec<Proposal> {
    self.state.lock().proposals.values().rev().cloned().collect()
  }

  pub fn set_latency(&self, latency: Duration) {
    self.state.lock().latency = latency;
  }

  /// Proposal reads capture the ledger state, then wait `delay` before
  /// answering, so the answer can be older than the ledger by the time it
  /// arrives.
  pub fn delay_replies(&self, delay: Duration) {
    self.state.lock().reply_delay = delay;
  }

  /// `list_proposals` returns only the newest `limit` proposals.
  pub fn set_list_limit(&self, limit: Option<usize>) {
    self.state.lock().list_limit = limit;
  }

  pub fn set_paged_available(&self, available: bool) {
    self.state.lock().paged_available = available;
  }

  /// Fails every call of `method` until restored.
  pub fn fail_method(&self, method: &'static str) {
    self.state.lock().failures.insert(method, usize::MAX);
  }

  /// Fails the next `times` calls of `method`.
  pub fn fail_next(&self, method: &'static str, times: usize) {
    self.state.lock().failures.insert(method, times);
  }

  pub fn restore_method(&self, method: &'static str) {
    self.state.lock().failures.remove(method);
  }

  pub fn set_unreadable(&self, id: u64, unreadable: bool) {
    let mut state = self.state.lock();
    if unreadable {
      state.unreadable.insert(id);
    } else {
      state.unreadable.remove(&id);
    }
  }

  pub fn set_balance(&self, token: &Address, amount: RawAmount) {
    self.state.lock().balances.insert(token.clone(), amount);
  }

  pub fn set_staked(&self, token: &Address, amount: RawAmount) {
    self.state.lock().staked.insert(token.clone(), amount);
  }

  pub fn set_rewards(&self, token: &Address, amount: RawAmount) {
    self.state.lock().rewards.insert(token.clone(), amount);
  }

  pub fn set_allowance(&self, token: &Address, spender: &Address, amount: RawAmount) {
    self.state.lock().allowances.insert((token.clone(), spender.clone()), amount);
  }

  pub fn set_decimals(&self, token: &Address, decimals: u32) {
    self.state.lock().decimals.insert(token.clone(), decimals);
  }

  pub fn script_submit(&self, result: Result<(), LedgerError>) {
    self.state.lock().submit_script.push_back(result);
  }

  pub fn script_confirmation(&self, outcome: ConfirmOutcome) {
    self.state.lock().confirm_script.push_back(outcome);
  }

  /// Receipts stop naming the proposal they created.
  pub fn omit_receipt_proposal_id(&self, omit: bool) {
    self.state.lock().omit_proposal_id = omit;
  }

  /// Every transaction passed to `submit`, accepted or not.
  pub fn submitted(&self) -> Vec<Transaction> {
    self.state.lock().submitted.clone()
  }

  pub fn calls(&self, method: &'static str) -> usize {
    self.state.lock().calls.get(method).copied().unwrap_or(0)
  }

  async fn enter(&self, method: &'static str) -> Result<(), LedgerError> {
    let latency = {
      let mut state = self.state.lock();
      *state.calls.entry(method).or_default() += 1;
      state.latency
    };
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }

    let mut state = self.state.lock();
    match state.failures.get_mut(method) {
      Some(remaining) if *remaining > 0 => {
        if *remaining != usize::MAX {
          *remaining -= 1;
        }
        Err(LedgerError::Transport(format!("{method} failed")))
      }
      _ => Ok(()),
    }
  }

  async fn reply<T>(&self, value: T) -> T {
    let delay = self.state.lock().reply_delay;
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    value
  }

  fn apply(&self, state: &mut MockState, tx: &Transaction) -> Option<u64> {
    match tx {
      Transaction::Approve { token, spender, amount } => {
        state.allowances.insert((token.clone(), spender.clone()), *amount);
      }
      Transaction::Stake { token, amount } => {
        let available = state.balances.entry(token.clone()).or_default();
        *available = available.saturating_sub(*amount);
        let staked = state.staked.entry(token.clone()).or_default();
        *staked = staked.saturating_add(*amount);
      }
      Transaction::Unstake { token, amount } => {
        let staked = state.staked.entry(token.clone()).or_default();
        *staked = staked.saturating_sub(*amount);
        let available = state.balances.entry(token.clone()).or_default();
        *available = available.saturating_add(*amount);
      }
      Transaction::Claim { token } => {
        let rewards = state.rewards.remove(token).unwrap_or_default();
        let available = state.balances.entry(token.clone()).or_default();
        *available = available.saturating_add(rewards);
      }
      Transaction::CreateProposal { action } => {
        let id = state.proposals.keys().next_back().copied().unwrap_or(0) + 1;
        let mut proposal = sample_proposal(id, 0);
        proposal.action = action.clone();
        proposal.proposer = self.owner.clone();
        state.proposals.insert(id, proposal);
        return Some(id);
      }
      Transaction::ApproveProposal { id } => {
        if let Some(proposal) = state.proposals.get_mut(id) {
          proposal.approval_count += 1;
        }
      }
      Transaction::RejectProposal { id } => {
        if let Some(proposal) = state.proposals.get_mut(id) {
          proposal.rejected = true;
        }
      }
      Transaction::ExecuteProposal { id } => {
        if let Some(proposal) = state.proposals.get_mut(id) {
          proposal.executed = true;
        }
      }
    }
    None
  }
}

#[async_trait]
impl LedgerClient for MockLedger {
  async fn list_proposals(&self) -> Result<Vec<Proposal>, LedgerError> {
    self.enter("list_proposals").await?;
    let limit = self.state.lock().list_limit.unwrap_or(usize::MAX);
    let proposals: Vec<Proposal> = self.proposals().into_iter().take(limit).collect();
    Ok(self.reply(proposals).await)
  }

  async fn list_proposals_paged(&self, skip: u64, limit: u64) -> Result<Vec<Proposal>, LedgerError> {
    self.enter("list_proposals_paged").await?;
    let page: Vec<Proposal> = {
      let state = self.state.lock();
      if !state.paged_available {
        return Err(LedgerError::Unavailable("gov_listProposalsPaged".to_string()));
      }
      state.proposals.values().rev().skip(skip as usize).take(limit as usize).cloned().collect()
    };
    Ok(self.reply(page).await)
  }

  async fn get_proposal(&self, id: u64) -> Result<Proposal, LedgerError> {
    self.enter("get_proposal").await?;
    let read = {
      let state = self.state.lock();
      if state.unreadable.contains(&id) {
        Err(LedgerError::Transport(format!("proposal {id} unreadable")))
      } else {
        state.proposals.get(&id).cloned().ok_or(LedgerError::NotFound(id))
      }
    };
    self.reply(read).await
  }

  async fn get_proposal_count(&self) -> Result<u64, LedgerError> {
    self.enter("get_proposal_count").await?;
    let count = self.state.lock().proposals.keys().next_back().copied().unwrap_or(0);
    Ok(self.reply(count).await)
  }

  async fn get_allowance(&self, token: &Address, _owner: &Address, spender: &Address) -> Result<RawAmount, LedgerError> {
    self.enter("get_allowance").await?;
    Ok(self.state.lock().allowances.get(&(token.clone(), spender.clone())).copied().unwrap_or_default())
  }

  async fn get_balance(&self, token: &Address, _owner: &Address) -> Result<RawAmount, LedgerError> {
    self.enter("get_balance").await?;
    Ok(self.state.lock().balances.get(token).copied().unwrap_or_default())
  }

  async fn get_staked(&self, token: &Address, _owner: &Address) -> Result<RawAmount, LedgerError> {
    self.enter("get_staked").await?;
    Ok(self.state.lock().staked.get(token).copied().unwrap_or_default())
  }

  async fn get_pending_rewards(&self, token: &Address, _owner: &Address) -> Result<RawAmount, LedgerError> {
    self.enter("get_pending_rewards").await?;
    Ok(self.state.lock().rewards.get(token).copied().unwrap_or_default())
  }

  async fn get_decimals(&self, token: &Address) -> Result<u32, LedgerError> {
    self.enter("get_decimals").await?;
    Ok(self.state.lock().decimals.get(token).copied().unwrap_or(crate::DEFAULT_TOKEN_DECIMALS))
  }

  async fn submit(&self, tx: &Transaction) -> Result<TxHash, LedgerError> {
    self.enter("submit").await?;
    let mut state = self.state.lock();
    state.submitted.push(tx.clone());
    state.submit_script.pop_front().unwrap_or(Ok(()))?;

    let hash = TxHash(format!("0x{:064x}", state.submitted.len()));
    state.in_flight.insert(hash.clone(), tx.clone());
    Ok(hash)
  }

  async fn wait_for_confirmation(&self, hash: &TxHash) -> Result<Receipt, LedgerError> {
    self.enter("wait_for_confirmation").await?;
    let outcome = self.state.lock().confirm_script.pop_front().unwrap_or(ConfirmOutcome::Confirmed);

    let (success, revert_reason) = match outcome {
      ConfirmOutcome::Confirmed => (true, None),
      ConfirmOutcome::Reverted(reason) => (false, Some(reason)),
      ConfirmOutcome::Failed(error) => return Err(error),
      ConfirmOutcome::Never => std::future::pending().await,
    };

    let mut state = self.state.lock();
    let tx = state.in_flight.remove(hash).ok_or_else(|| LedgerError::Malformed(format!("unknown transaction {hash}")))?;
    state.blocks += 1;
    let created = if success { self.apply(&mut state, &tx) } else { None };

    Ok(Receipt {
      hash: hash.clone(),
      block_number: state.blocks,
      success,
      revert_reason,
      proposal_id: if state.omit_proposal_id { None } else { created },
    })
  }
}

/// A pending `SetRate` proposal with three required approvals.
pub fn sample_proposal(id: u64, approvals: u32) -> Proposal {
  Proposal {
    id: ProposalId::Confirmed(id),
    action: ProposalAction::SetRate { token: Address::new("0xstake"), rate: RawAmount(u128::from(id) * 100) },
    approval_count: approvals,
    required_approvals: 3,
    executed: false,
    rejected: false,
    expired: false,
    proposer: Address::new("0xproposer"),
    created_at: 1_700_000_000 + id as i64,
    expires_at: 1_700_604_800 + id as i64,
    is_optimistic: false,
  }
}
