//! RelayDrop client library
//!
//! Address discovery, candidate ordering, connection racing and the chunked
//! send/receive drivers. The `relaydrop` binary is a thin CLI over this.

pub mod args;
pub mod candidates;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod racer;
pub mod session;
pub mod transform;
pub mod transport;

pub use candidates::{Candidate, CandidateSource, nearby_lan_candidates, prioritize};
pub use config::ClientConfig;
pub use discovery::{DiscoveryConfig, DiscoveryReport, discover};
pub use engine::{CancelFlag, ChunkEngine, ReceiveTable, TransferProgress, TransferResult};
pub use error::{DiscoveryError, TransferError};
pub use outcome::{OutcomeSink, OutcomeStatus, TracingOutcomeSink, TransferOutcome};
pub use racer::{RaceConfig, RaceError, RaceStrategy, race};
pub use session::{ReceiveRequest, SendRequest, SessionHooks, receive_file, send_file};
pub use transform::{ByteTransform, Passthrough};
