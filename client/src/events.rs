use derive_more::Display;
use tokio::sync::broadcast;

use crate::{Address, OperationKind, Phase, ProposalId};

const EVENT_BUFFER: usize = 256;

/// A phase change of one operation kind in the transaction orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
  pub kind: OperationKind,
  pub from: Phase,
  pub to: Phase,
}

/// Signals for the rendering layer. The engine never renders itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
  CacheChanged,
  RenderProposal(ProposalId),
  RenderBalances(Address),
  Phase(PhaseTransition),
}

/// Fan-out channel for `EngineEvent`s. Emitting with no subscriber is not an
/// error; a subscriber that falls behind sees `RecvError::Lagged` and should
/// re-read the whole cache.
#[derive(Clone)]
pub struct EventBus {
  sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    let (sender, _) = broadcast::channel(EVENT_BUFFER);
    Self { sender }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.sender.subscribe()
  }

  pub fn emit(&self, event: EngineEvent) {
    tracing::trace!("event {:?}", event);
    let _ = self.sender.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
  #[display("success")]
  Success,
  #[display("failure")]
  Failure,
  #[display("info")]
  Info,
}

/// A short, kind-tagged message for the UI's toast area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub kind: NotificationKind,
  pub title: String,
  pub message: String,
}

impl Notification {
  pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self { kind: NotificationKind::Success, title: title.into(), message: message.into() }
  }

  pub fn failure(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self { kind: NotificationKind::Failure, title: title.into(), message: message.into() }
  }

  pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self { kind: NotificationKind::Info, title: title.into(), message: message.into() }
  }
}

pub trait NotificationSink: Send + Sync {
  fn notify(&self, notification: Notification);
}

/// Writes notifications to the log. Used by the headless binary.
pub struct TracingSink;

impl NotificationSink for TracingSink {
  fn notify(&self, notification: Notification) {
    match notification.kind {
      NotificationKind::Failure => tracing::warn!("{}: {}", notification.title, notification.message),
      NotificationKind::Success | NotificationKind::Info => {
        tracing::info!("{}: {}", notification.title, notification.message)
      }
    }
  }
}

#[cfg(test)]
pub(crate) use recording::RecordingSink;


#[cfg(test)]
pub(crate) fn drain(receiver: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
  let mut events = Vec::new();
  while let Ok(event) = receiver.try_recv() {
    events.push(event);
  }
  events
}
