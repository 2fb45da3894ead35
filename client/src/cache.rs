use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
};

use parking_lot::RwLock;

use crate::{Fingerprint, Proposal, ProposalId};

struct CacheEntry {
  proposal: Arc<Proposal>,
  fingerprint: Fingerprint,
}

#[derive(Default)]
struct CacheState {
  entries: BTreeMap<ProposalId, CacheEntry>,
  // confirmed id -> provisional record it will replace
  links: HashMap<u64, ProposalId>,
  generation: u64,
}

impl CacheState {
  fn insert(&mut self, proposal: Proposal) -> Option<ProposalId> {
    let id = proposal.id;
    let fingerprint = proposal.fingerprint();
    self.entries.insert(id, CacheEntry { proposal: Arc::new(proposal), fingerprint });

    let provisional = self.links.remove(&id.confirmed()?)?;
    self.entries.remove(&provisional).map(|_| provisional)
  }
}

/// Session-long store of proposals keyed by id.
///
/// Records are handed out as shared immutable snapshots. To change one,
/// build a new `Proposal` and `put` it; the fingerprint is recomputed on
/// every write. Provisional records survive `replace_confirmed`, and a
/// provisional record linked to a confirmed id disappears in the same write
/// that inserts the confirmed record, so a proposal is never listed twice.
#[derive(Default)]
pub struct ProposalCache {
  state: RwLock<CacheState>,
}

impl ProposalCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, id: ProposalId) -> Option<Arc<Proposal>> {
    self.state.read().entries.get(&id).map(|entry| entry.proposal.clone())
  }

  /// Inserts or overwrites by id. Returns the provisional id this write
  /// resolved, if any.
  pub fn put(&self, proposal: Proposal) -> Option<ProposalId> {
    self.state.write().insert(proposal)
  }

  pub fn remove(&self, id: ProposalId) -> Option<Arc<Proposal>> {
    let mut state = self.state.write();
    state.links.retain(|_, provisional| *provisional != id);
    state.entries.remove(&id).map(|entry| entry.proposal)
  }

  /// Every record, id-descending (provisional records first).
  pub fn all(&self) -> Vec<Arc<Proposal>> {
    self.state.read().entries.values().rev().map(|entry| entry.proposal.clone()).collect()
  }

  pub fn fingerprint_of(&self, id: ProposalId) -> Option<Fingerprint> {
    self.state.read().entries.get(&id).map(|entry| entry.fingerprint)
  }

  pub fn contains(&self, id: ProposalId) -> bool {
    self.state.read().entries.contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.state.read().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state.read().entries.is_empty()
  }

  pub fn confirmed_len(&self) -> usize {
    self.state.read().entries.keys().filter(|id| !id.is_provisional()).count()
  }

  pub fn lowest_confirmed_id(&self) -> Option<u64> {
    self.state.read().entries.keys().next().and_then(ProposalId::confirmed)
  }

  /// Bumped by every `replace_confirmed`.
  pub fn generation(&self) -> u64 {
    self.state.read().generation
  }

  /// Full reload: drops every confirmed record from the lowest listed id
  /// upwards and inserts `proposals`. Older confirmed records (paged in
  /// below a bounded list) and provisional records are kept. An empty list
  /// drops every confirmed record.
  pub fn replace_confirmed(&self, proposals: Vec<Proposal>) -> Vec<ProposalId> {
    let floor = proposals.iter().filter_map(|proposal| proposal.id.confirmed()).min().unwrap_or(0);
    let mut state = self.state.write();
    state.entries.retain(|id, _| match id.confirmed() {
      Some(id) => floor > 0 && id < floor,
      None => true,
    });
    state.generation += 1;
    proposals.into_iter().filter(|proposal| !proposal.id.is_provisional()).filter_map(|p| state.insert(p)).collect()
  }

  /// Writes `proposals` only if no full reload happened since `generation`
  /// was read. Returns `None` when the batch is stale and nothing was
  /// written, otherwise the provisional ids the batch resolved.
  pub fn apply_if_current(&self, generation: u64, proposals: Vec<Proposal>) -> Option<Vec<ProposalId>> {
    let mut state = self.state.write();
    if state.generation != generation {
      return None;
    }
    Some(proposals.into_iter().filter_map(|proposal| state.insert(proposal)).collect())
  }

  /// Records that `provisional` will become `confirmed`. If the confirmed
  /// record is already cached the provisional one is dropped right away.
  pub fn link(&self, provisional: ProposalId, confirmed: u64) -> bool {
    let mut state = self.state.write();
    if state.entries.contains_key(&ProposalId::Confirmed(confirmed)) {
      state.entries.remove(&provisional);
      return true;
    }
    state.links.insert(confirmed, provisional);
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sample_proposal;

  #[test]
  fn test_put_overwrites_and_refingerprints() {
    let cache = ProposalCache::new();
    cache.put(sample_proposal(4, 1));
    let before = cache.fingerprint_of(ProposalId::Confirmed(4)).unwrap();

    cache.put(sample_proposal(4, 2));
    let after = cache.fingerprint_of(ProposalId::Confirmed(4)).unwrap();

    assert_eq!(cache.len(), 1);
    assert_eq!(before.approval_count, 1);
    assert_eq!(after.approval_count, 2);
  }

  #[test]
  fn test_all_is_id_descending_with_provisional_first() {
    let cache = ProposalCache::new();
    cache.put(sample_proposal(3, 0));
    cache.put(sample_proposal(5, 0));
    cache.put(Proposal { id: ProposalId::Provisional(1), is_optimistic: true, ..sample_proposal(0, 0) });
    cache.put(sample_proposal(4, 0));

    let ids: Vec<ProposalId> = cache.all().iter().map(|p| p.id).collect();
    assert_eq!(
      ids,
      vec![ProposalId::Provisional(1), ProposalId::Confirmed(5), ProposalId::Confirmed(4), ProposalId::Confirmed(3)]
    );
    assert_eq!(cache.lowest_confirmed_id(), Some(3));
    assert_eq!(cache.confirmed_len(), 3);
  }

  #[test]
  fn test_snapshots_are_not_affected_by_later_writes() {
    let cache = ProposalCache::new();
    cache.put(sample_proposal(1, 0));
    let snapshot = cache.get(ProposalId::Confirmed(1)).unwrap();

    cache.put(sample_proposal(1, 3));

    assert_eq!(snapshot.approval_count, 0);
    assert_eq!(cache.get(ProposalId::Confirmed(1)).unwrap().approval_count, 3);
  }

  #[test]
  fn test_replace_confirmed_keeps_provisional_records() {
    let cache = ProposalCache::new();
    cache.put(sample_proposal(1, 0));
    cache.put(sample_proposal(2, 0));
    cache.put(Proposal { id: ProposalId::Provisional(1), ..sample_proposal(0, 0) });
    let generation = cache.generation();

    cache.replace_confirmed(vec![sample_proposal(1, 1), sample_proposal(3, 0)]);

    assert!(!cache.contains(ProposalId::Confirmed(2)));
    assert!(cache.contains(ProposalId::Confirmed(3)));
    assert!(cache.contains(ProposalId::Provisional(1)));
    assert_eq!(cache.generation(), generation + 1);
  }

  #[test]
  fn test_replace_confirmed_keeps_records_below_the_listed_window() {
    let cache = ProposalCache::new();
    for id in 1 ..= 6 {
      cache.put(sample_proposal(id, 0));
    }

    cache.replace_confirmed(vec![sample_proposal(5, 1), sample_proposal(4, 0)]);

    let ids: Vec<ProposalId> = cache.all().iter().map(|p| p.id).collect();
    assert_eq!(ids, (1 ..= 5).rev().map(ProposalId::Confirmed).collect::<Vec<_>>());
    assert_eq!(cache.get(ProposalId::Confirmed(5)).unwrap().approval_count, 1);

    cache.replace_confirmed(Vec::new());
    assert!(cache.is_empty());
  }

  #[test]
  fn test_apply_if_current_rejects_stale_batches() {
    let cache = ProposalCache::new();
    let generation = cache.generation();
    cache.replace_confirmed(vec![sample_proposal(1, 0)]);

    assert!(cache.apply_if_current(generation, vec![sample_proposal(1, 2)]).is_none());
    assert_eq!(cache.get(ProposalId::Confirmed(1)).unwrap().approval_count, 0);

    let current = cache.generation();
    assert!(cache.apply_if_current(current, vec![sample_proposal(1, 2)]).is_some());
    assert_eq!(cache.get(ProposalId::Confirmed(1)).unwrap().approval_count, 2);
  }

  #[test]
  fn test_linked_provisional_is_replaced_by_confirmed_record() {
    let cache = ProposalCache::new();
    let provisional = ProposalId::Provisional(7);
    cache.put(Proposal { id: provisional, ..sample_proposal(0, 0) });

    assert!(!cache.link(provisional, 12));
    assert!(cache.contains(provisional));

    let resolved = cache.replace_confirmed(vec![sample_proposal(12, 0)]);
    assert_eq!(resolved, vec![provisional]);
    assert!(!cache.contains(provisional));
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn test_link_to_already_cached_record() {
    let cache = ProposalCache::new();
    cache.put(sample_proposal(12, 0));
    cache.put(Proposal { id: ProposalId::Provisional(1), ..sample_proposal(0, 0) });

    assert!(cache.link(ProposalId::Provisional(1), 12));
    assert_eq!(cache.len(), 1);
  }
}
