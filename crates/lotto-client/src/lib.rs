// Agency client for the central lottery server.
//
// The client reads an agency's bets, packs them into batches that fit one
// frame, submits them one connection at a time, reports completion and then
// polls until the server publishes this agency's winners.
//
// Layering, bottom up:
// - `wire`: length-prefixed frames over any tokio stream.
// - `source` and `packer`: a forward-only record stream cut into maximal
//   batches.
// - `session`: one request/reply exchange per connection, cancellable.
// - `controller`: the submit, complete, poll state machine.
//
// Nothing here spawns background tasks. Shutdown is a `CancellationToken`
// owned by the caller; every wait and every exchange races it.
pub mod config;
pub mod controller;
pub mod error;
pub mod packer;
pub mod session;
pub mod source;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use config::ClientConfig;
pub use controller::{ClientLoop, LoopOutcome, LoopSettings, LoopState, LoopSummary};
pub use error::{Error, Result};
pub use lotto_wire::Bet;
pub use packer::{Batch, BatchPacker, DEFAULT_BATCH_MAX_RECORDS};
pub use session::Session;
pub use source::{CsvSource, IterSource, RecordSource};
pub use tokio_util::sync::CancellationToken;
