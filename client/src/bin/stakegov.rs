use anyhow::Result;
use clap::Parser;
use stakegov_client::WatchArgs;

#[tokio::main]
async fn main() -> Result<()> {
  WatchArgs::parse().watch().await
}
