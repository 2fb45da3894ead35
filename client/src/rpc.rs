use std::{
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};

use anyhow::{ensure, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::{Address, LedgerClient, LedgerError, Proposal, RawAmount, Receipt, Transaction, TxHash};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// JSON-RPC 2.0 ledger client over HTTP.
///
/// Reads go to the first endpoint and move down the list on transport
/// failures, HTTP 429 and 5xx answers. Writes are sent to a single endpoint
/// only, since a lost answer does not mean the transaction was dropped.
/// Calls to one endpoint are spaced at least `min_interval` apart.
pub struct RpcLedger {
  client: Client,
  endpoints: Vec<Endpoint>,
  account: Address,
  min_interval: Duration,
  next_id: AtomicU64,
}

struct Endpoint {
  url: String,
  next_slot: Mutex<Instant>,
}

#[derive(Deserialize)]
struct RpcResponse {
  #[serde(default)]
  result: Option<Value>,
  #[serde(default)]
  error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
  code: i64,
  #[serde(default)]
  message: String,
}

/// Integers beyond 53 bits travel as decimal strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Quantity {
  Number(u64),
  Text(String),
}

impl Quantity {
  fn into_u64(self) -> Result<u64, LedgerError> {
    match self {
      Quantity::Number(value) => Ok(value),
      Quantity::Text(text) => text.trim().parse().map_err(|_| LedgerError::Malformed(format!("not a count: {text}"))),
    }
  }
}

impl RpcLedger {
  pub fn new(
    urls: Vec<String>,
    account: Address,
    min_interval: Duration,
    request_timeout: Duration,
  ) -> anyhow::Result<Self> {
    let client = Client::builder().timeout(request_timeout).build().context("failed to build the HTTP client")?;
    Self::with_client(client, urls, account, min_interval)
  }

  pub fn with_client(
    client: Client,
    urls: Vec<String>,
    account: Address,
    min_interval: Duration,
  ) -> anyhow::Result<Self> {
    ensure!(!urls.is_empty(), "at least one RPC endpoint is required");
    let now = Instant::now();
    let endpoints =
      urls.into_iter().map(|url| Endpoint { url: url.trim().to_string(), next_slot: Mutex::new(now) }).collect();
    Ok(Self { client, endpoints, account, min_interval, next_id: AtomicU64::new(1) })
  }

  async fn read<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
    self.call(method, params, self.endpoints.len()).await
  }

  async fn write<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
    self.call(method, params, 1).await
  }

  async fn call<T: DeserializeOwned>(&self, method: &str, params: Value, attempts: usize) -> Result<T, LedgerError> {
    let mut last_error = LedgerError::Transport("no endpoint answered".to_string());

    for endpoint in self.endpoints.iter().take(attempts) {
      self.throttle(endpoint).await;
      let body = envelope(self.next_id.fetch_add(1, Ordering::Relaxed), method, &params);

      let response = match self.client.post(&endpoint.url).json(&body).send().await {
        Ok(response) => response,
        Err(error) => {
          tracing::warn!("{} via {} failed: {}", method, endpoint.url, error);
          last_error =
            if error.is_timeout() { LedgerError::Timeout } else { LedgerError::Transport(error.to_string()) };
          continue;
        }
      };

      let status = response.status();
      if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        tracing::warn!("{} via {} answered {}, trying the next endpoint", method, endpoint.url, status);
        last_error = LedgerError::Transport(format!("{} answered {status}", endpoint.url));
        continue;
      }

      let response: RpcResponse = response.json().await.map_err(|error| LedgerError::Malformed(error.to_string()))?;
      return decode(method, response);
    }

    Err(last_error)
  }

  async fn throttle(&self, endpoint: &Endpoint) {
    let slot = {
      let mut next_slot = endpoint.next_slot.lock();
      let slot = (*next_slot).max(Instant::now());
      *next_slot = slot + self.min_interval;
      slot
    };
    tokio::time::sleep_until(slot).await;
  }
}

fn envelope(id: u64, method: &str, params: &Value) -> Value {
  json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

fn decode<T: DeserializeOwned>(method: &str, response: RpcResponse) -> Result<T, LedgerError> {
  if let Some(error) = response.error {
    return Err(classify(error.code, &error.message));
  }
  let result = response.result.unwrap_or(Value::Null);
  serde_json::from_value(result).map_err(|error| LedgerError::Malformed(format!("{method}: {error}")))
}

/// Maps a JSON-RPC error object to a ledger error kind.
pub fn classify(code: i64, message: &str) -> LedgerError {
  let lowered = message.to_ascii_lowercase();
  match code {
    4001 => LedgerError::UserRejected,
    -32601 => LedgerError::Unavailable(message.to_string()),
    -32003 => LedgerError::InsufficientFunds,
    _ if lowered.contains("insufficient funds") => LedgerError::InsufficientFunds,
    3 => LedgerError::Reverted(revert_reason(message)),
    _ if lowered.contains("revert") => LedgerError::Reverted(revert_reason(message)),
    _ => LedgerError::Rpc { code, message: message.to_string() },
  }
}

fn revert_reason(message: &str) -> String {
  let reason = message.split_once("reverted:").map_or(message, |(_, reason)| reason).trim();
  if reason.is_empty() {
    "no reason given".to_string()
  } else {
    reason.to_string()
  }
}

#[async_trait]
impl LedgerClient for RpcLedger {
  async fn list_proposals(&self) -> Result<Vec<Proposal>, LedgerError> {
    self.read("gov_listProposals", json!([])).await
  }

  async fn list_proposals_paged(&self, skip: u64, limit: u64) -> Result<Vec<Proposal>, LedgerError> {
    self.read("gov_listProposalsPaged", json!([skip, limit])).await
  }

  async fn get_proposal(&self, id: u64) -> Result<Proposal, LedgerError> {
    let proposal: Option<Proposal> = self.read("gov_getProposal", json!([id])).await?;
    proposal.ok_or(LedgerError::NotFound(id))
  }

  async fn get_proposal_count(&self) -> Result<u64, LedgerError> {
    self.read::<Quantity>("gov_getProposalCount", json!([])).await?.into_u64()
  }

  async fn get_allowance(&self, token: &Address, owner: &Address, spender: &Address) -> Result<RawAmount, LedgerError> {
    self.read("token_allowance", json!([token, owner, spender])).await
  }

  async fn get_balance(&self, token: &Address, owner: &Address) -> Result<RawAmount, LedgerError> {
    self.read("token_balanceOf", json!([token, owner])).await
  }

  async fn get_staked(&self, token: &Address, owner: &Address) -> Result<RawAmount, LedgerError> {
    self.read("staking_stakedOf", json!([token, owner])).await
  }

  async fn get_pending_rewards(&self, token: &Address, owner: &Address) -> Result<RawAmount, LedgerError> {
    self.read("staking_pendingRewards", json!([token, owner])).await
  }

  async fn get_decimals(&self, token: &Address) -> Result<u32, LedgerError> {
    self.read("token_decimals", json!([token])).await
  }

  async fn submit(&self, tx: &Transaction) -> Result<TxHash, LedgerError> {
    tracing::debug!("sending {:?} from {}", tx, self.account);
    self.write("wallet_sendTransaction", json!([self.account, tx])).await
  }

  async fn wait_for_confirmation(&self, hash: &TxHash) -> Result<Receipt, LedgerError> {
    loop {
      let receipt: Option<Receipt> = self.read("gov_getReceipt", json!([hash])).await?;
      if let Some(receipt) = receipt {
        return Ok(receipt);
      }
      tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
    }
  }
}
