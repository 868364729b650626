//! Transfer outcomes and where they are recorded

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How a transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Record of one finished transfer, from one side's point of view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub transfer_code: String,
    pub file_name: Option<String>,
    pub size: u64,
    /// Hex SHA-256 of the bytes that crossed the wire
    pub checksum: Option<String>,
    pub status: OutcomeStatus,
    /// The other side's address as observed by the relay
    pub peer_address: Option<String>,
    pub error: Option<String>,
    /// Epoch milliseconds
    pub finished_at: i64,
}

impl TransferOutcome {
    pub fn new(transfer_code: &str, status: OutcomeStatus) -> Self {
        Self {
            transfer_code: transfer_code.to_string(),
            file_name: None,
            size: 0,
            checksum: None,
            status,
            peer_address: None,
            error: None,
            finished_at: relaydrop_common::time::now_millis(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}

/// Receives every finished transfer (history, UI, logs)
pub trait OutcomeSink: Send + Sync {
    fn record(&self, outcome: &TransferOutcome);
}

/// Writes outcomes to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOutcomeSink;

impl OutcomeSink for TracingOutcomeSink {
    fn record(&self, outcome: &TransferOutcome) {
        let file = outcome.file_name.as_deref().unwrap_or("-");
        let peer = outcome.peer_address.as_deref().unwrap_or("-");
        if outcome.is_success() {
            info!(
                code = %outcome.transfer_code,
                file,
                size = outcome.size,
                checksum = outcome.checksum.as_deref().unwrap_or("-"),
                peer,
                "transfer completed"
            );
        } else {
            warn!(
                code = %outcome.transfer_code,
                status = %outcome.status,
                file,
                peer,
                error = outcome.error.as_deref().unwrap_or("-"),
                "transfer did not complete"
            );
        }
    }
}
