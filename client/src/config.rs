use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, ValueEnum};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Address, RpcLedger};

#[derive(Clone, Args)]
pub struct EngineConfig {
  /// The network the contracts are deployed on.
  #[clap(long, env, default_value = "mainnet")]
  pub network: Network,
  /// Comma-separated JSON-RPC endpoints, tried in order.
  #[clap(long, env, value_delimiter = ',', required = true)]
  pub rpc_urls: Vec<String>,
  /// The connected account.
  #[clap(long, env)]
  pub account: String,
  /// The staking contract; spender of every staking approval.
  #[clap(long, env)]
  pub staking_contract: String,
  /// Comma-separated staking tokens whose balances are tracked.
  #[clap(long, env, value_delimiter = ',')]
  pub tokens: Vec<String>,
  /// Proposals per "load more" page.
  #[clap(long, env, default_value = "20")]
  pub page_size: u64,
  /// Seconds between refresh ticks.
  #[clap(long, env, default_value = "15")]
  pub refresh_interval_secs: u64,
  /// Seconds before a sync read is abandoned.
  #[clap(long, env, default_value = "10")]
  pub sync_timeout_secs: u64,
  /// Milliseconds to wait after a confirmation before reading the new record.
  #[clap(long, env, default_value = "2000")]
  pub confirm_poll_delay_ms: u64,
  /// Seconds before an unconfirmed transaction is reported as failed.
  #[clap(long, env, default_value = "120")]
  pub confirm_timeout_secs: u64,
  /// Minimum milliseconds between two calls to the same endpoint.
  #[clap(long, env, default_value = "250")]
  pub rpc_min_interval_ms: u64,
  /// Seconds a balance snapshot is served from cache.
  #[clap(long, env, default_value = "30")]
  pub balance_ttl_secs: u64,
  /// Required approvals shown on provisional proposals.
  #[clap(long, env, default_value = "3")]
  pub default_required_approvals: u32,
}

impl EngineConfig {
  pub fn to_settings(&self) -> Result<Settings> {
    ensure!(self.page_size > 0, "page size must be positive");
    ensure!(self.refresh_interval_secs > 0, "refresh interval must be positive");

    Ok(Settings {
      account: Address::new(self.account.trim()),
      staking_contract: Address::new(self.staking_contract.trim()),
      tokens: self.tokens.iter().map(|token| Address::new(token.trim())).collect(),
      page_size: self.page_size,
      refresh_interval: Duration::from_secs(self.refresh_interval_secs),
      sync_timeout: Duration::from_secs(self.sync_timeout_secs),
      confirm_poll_delay: Duration::from_millis(self.confirm_poll_delay_ms),
      confirm_timeout: Duration::from_secs(self.confirm_timeout_secs),
      balance_ttl: Duration::from_secs(self.balance_ttl_secs),
      default_required_approvals: self.default_required_approvals,
    })
  }

  pub fn to_ledger(&self) -> Result<RpcLedger> {
    RpcLedger::new(
      self.rpc_urls.clone(),
      Address::new(self.account.trim()),
      Duration::from_millis(self.rpc_min_interval_ms),
      Duration::from_secs(self.sync_timeout_secs),
    )
    .with_context(|| format!("failed to build the {} ledger client", self.network))
  }
}

/// Engine tunables, independent of the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
  pub account: Address,
  pub staking_contract: Address,
  pub tokens: Vec<Address>,
  pub page_size: u64,
  pub refresh_interval: Duration,
  pub sync_timeout: Duration,
  pub confirm_poll_delay: Duration,
  pub confirm_timeout: Duration,
  pub balance_ttl: Duration,
  pub default_required_approvals: u32,
}

impl Settings {
  pub fn new(account: Address, staking_contract: Address) -> Self {
    Self {
      account,
      staking_contract,
      tokens: Vec::new(),
      page_size: 20,
      refresh_interval: Duration::from_secs(15),
      sync_timeout: Duration::from_secs(10),
      confirm_poll_delay: Duration::from_secs(2),
      confirm_timeout: Duration::from_secs(120),
      balance_ttl: Duration::from_secs(30),
      default_required_approvals: 3,
    }
  }
}

#[derive(Clone, Copy, Parser, ValueEnum, Debug, Display, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Network {
  #[display("mainnet")]
  Mainnet,
  #[display("testnet")]
  Testnet,
  #[display("local")]
  Local,
}
