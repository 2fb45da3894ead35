use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use crate::{shutdown_signal, Engine, EngineConfig, EngineEvent, TracingSink};

#[derive(Clone, Parser)]
#[command(name = "stakegov", about = "Keeps a staking/governance proposal cache in sync with the ledger")]
pub struct WatchArgs {
  /// Log every render event, not only notifications and phase changes.
  #[clap(long, env)]
  pub log_renders: bool,
  /// Engine Args.
  #[command(flatten)]
  pub config: EngineConfig,
}

impl WatchArgs {
  pub async fn watch(&self) -> Result<()> {
    tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
      .init();

    let settings = self.config.to_settings()?;
    let ledger = Arc::new(self.config.to_ledger()?);
    tracing::info!(
      "Watching {} on {} through {} endpoint(s).",
      settings.account,
      self.config.network,
      self.config.rpc_urls.len()
    );

    let engine = Engine::new(settings, ledger, Arc::new(TracingSink));
    let mut events = engine.subscribe();
    let log_renders = self.log_renders;
    let logger = tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(EngineEvent::Phase(transition)) => {
            tracing::info!("{}: {} -> {}", transition.kind, transition.from, transition.to)
          }
          Ok(event) if log_renders => tracing::info!("{:?}", event),
          Ok(_) => {}
          Err(RecvError::Lagged(skipped)) => tracing::warn!("event log fell behind, {} events skipped", skipped),
          Err(RecvError::Closed) => break,
        }
      }
    });

    engine.start().await.context("initial proposal load failed")?;
    for proposal in engine.proposals() {
      tracing::info!(
        "{} {} ({}/{} approvals, {}): {}",
        proposal.id,
        proposal.action.title(),
        proposal.approval_count,
        proposal.required_approvals,
        proposal.lifecycle(),
        proposal.action.summary()
      );
    }

    engine.run(shutdown_signal()).await;
    logger.abort();
    Ok(())
  }
}
