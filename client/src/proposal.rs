use std::collections::HashSet;

use derive_more::Display;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{RawAmount, Wrapper};

/// An account or contract address as reported by the ledger.
#[derive(Serialize, Deserialize, Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  /// Addresses are compared case-insensitively; checksummed and lowercase
  /// spellings name the same account.
  pub fn matches(&self, other: &Address) -> bool {
    self.0.eq_ignore_ascii_case(&other.0)
  }
}

/// Identifies a cached proposal. `Provisional` ids belong to locally
/// synthesized records and sort above every confirmed id, so they lead an
/// id-descending list.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProposalId {
  #[display("#{_0}")]
  Confirmed(u64),
  #[display("pending-{_0}")]
  Provisional(u64),
}

impl ProposalId {
  pub fn confirmed(&self) -> Option<u64> {
    match self {
      ProposalId::Confirmed(id) => Some(*id),
      ProposalId::Provisional(_) => None,
    }
  }

  pub fn is_provisional(&self) -> bool {
    matches!(self, ProposalId::Provisional(_))
  }
}

impl Serialize for ProposalId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      ProposalId::Confirmed(id) => serializer.serialize_u64(*id),
      ProposalId::Provisional(_) => serializer.collect_str(self),
    }
  }
}

impl<'de> Deserialize<'de> for ProposalId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireId {
      Number(u64),
      Text(String),
    }

    match WireId::deserialize(deserializer)? {
      WireId::Number(id) => Ok(ProposalId::Confirmed(id)),
      WireId::Text(text) => {
        if let Some(local) = text.strip_prefix("pending-") {
          return local.parse().map(ProposalId::Provisional).map_err(de::Error::custom);
        }
        text.parse().map(ProposalId::Confirmed).map_err(de::Error::custom)
      }
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PairWeight {
  pub token: Address,
  pub weight: u32,
}

/// The governance action a proposal would perform once executed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum ProposalAction {
  SetRate { token: Address, rate: RawAmount },
  AddPair { token_a: Address, token_b: Address, weight: u32 },
  RemovePair { token_a: Address, token_b: Address },
  UpdateWeights { weights: Vec<PairWeight> },
  ChangeSigner { old_signer: Address, new_signer: Address },
  WithdrawRewards { recipient: Address, amount: RawAmount },
  /// A kind this client does not know yet. Kept so the proposal still shows
  /// up; it is never submitted.
  #[serde(other)]
  Unrecognized,
}

impl ProposalAction {
  pub fn title(&self) -> &'static str {
    match self {
      ProposalAction::SetRate { .. } => "Set reward rate",
      ProposalAction::AddPair { .. } => "Add pair",
      ProposalAction::RemovePair { .. } => "Remove pair",
      ProposalAction::UpdateWeights { .. } => "Update weights",
      ProposalAction::ChangeSigner { .. } => "Change signer",
      ProposalAction::WithdrawRewards { .. } => "Withdraw rewards",
      ProposalAction::Unrecognized => "Unknown action",
    }
  }

  pub fn summary(&self) -> String {
    match self {
      ProposalAction::SetRate { token, rate } => format!("set the reward rate of {token} to {rate}"),
      ProposalAction::AddPair { token_a, token_b, weight } => format!("add pair {token_a}/{token_b} with weight {weight}"),
      ProposalAction::RemovePair { token_a, token_b } => format!("remove pair {token_a}/{token_b}"),
      ProposalAction::UpdateWeights { weights } => format!("update {} pair weights", weights.len()),
      ProposalAction::ChangeSigner { old_signer, new_signer } => format!("replace signer {old_signer} with {new_signer}"),
      ProposalAction::WithdrawRewards { recipient, amount } => format!("withdraw {amount} rewards to {recipient}"),
      ProposalAction::Unrecognized => "an action this client does not recognize".to_string(),
    }
  }

  pub fn is_submittable(&self) -> bool {
    !matches!(self, ProposalAction::Unrecognized)
  }
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
  Pending,
  Approved,
  Executed,
  Rejected,
  Expired,
}

/// Mutable fields of a proposal, compared to detect ledger-side changes
/// without deep equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
  pub approval_count: u32,
  pub executed: bool,
  pub rejected: bool,
  pub expired: bool,
  pub lifecycle: LifecycleState,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
  pub id: ProposalId,
  pub action: ProposalAction,
  pub approval_count: u32,
  pub required_approvals: u32,
  #[serde(default)]
  pub executed: bool,
  #[serde(default)]
  pub rejected: bool,
  #[serde(default)]
  pub expired: bool,
  pub proposer: Address,
  pub created_at: i64,
  pub expires_at: i64,
  #[serde(skip)]
  pub is_optimistic: bool,
}

impl Proposal {
  /// Derived from the raw flags; executed wins over rejected, which wins
  /// over expired.
  pub fn lifecycle(&self) -> LifecycleState {
    if self.executed {
      LifecycleState::Executed
    } else if self.rejected {
      LifecycleState::Rejected
    } else if self.expired {
      LifecycleState::Expired
    } else if self.approval_count >= self.required_approvals {
      LifecycleState::Approved
    } else {
      LifecycleState::Pending
    }
  }

  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint {
      approval_count: self.approval_count,
      executed: self.executed,
      rejected: self.rejected,
      expired: self.expired,
      lifecycle: self.lifecycle(),
    }
  }

  pub fn is_open(&self) -> bool {
    matches!(self.lifecycle(), LifecycleState::Pending | LifecycleState::Approved)
  }

  /// Proposers may not vote on their own proposals, and nobody votes on a
  /// provisional or closed one.
  pub fn can_vote(&self, user: &Address) -> bool {
    !self.is_optimistic && self.is_open() && !self.proposer.matches(user)
  }
}

impl Wrapper<Vec<Proposal>> {
  /// Sorts id-descending and keeps the first record seen for each id.
  pub fn newest_first(mut self) -> Self {
    self.0.sort_by(|a, b| b.id.cmp(&a.id));
    let mut seen = HashSet::new();
    self.0.retain(|proposal| seen.insert(proposal.id));
    self
  }
}
