mod amount;
mod balances;
mod cache;
mod config;
mod engine;
mod error;
mod events;
mod ledger;
mod loader;
mod optimistic;
mod orchestrator;
mod proposal;
mod rpc;
mod sync;
mod util;
mod watch;

pub use amount::*;
pub use balances::*;
pub use cache::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use ledger::*;
pub use loader::*;
pub use optimistic::*;
pub use orchestrator::*;
pub use proposal::*;
pub use rpc::*;
pub use sync::*;
pub use util::*;
pub use watch::*;
