//! User-facing CLI strings
//!
//! Everything the `relaydrop` binary prints to stdout/stderr lives here.

pub const MSG_BANNER: &str = "RelayDrop v";
pub const MSG_HOSTING_RELAY: &str = "Hosting relay on ";
pub const MSG_TRANSFER_CODE: &str = "Transfer code: ";
pub const MSG_RECEIVER_HINT: &str = "On the receiving machine run:";
pub const MSG_WAITING_FOR_RECEIVER: &str = "Waiting for the receiver to connect...";
pub const MSG_CANCELLING: &str = "Cancelling transfer...";
pub const MSG_SENT: &str = "Sent ";
pub const MSG_RECEIVED: &str = "Received ";
pub const MSG_CHECKSUM: &str = "SHA-256: ";
pub const MSG_PEER: &str = "Peer: ";
pub const MSG_PROGRESS: &str = "Progress: ";

pub const MSG_DISCOVER_LOCAL: &str = "Local addresses:";
pub const MSG_DISCOVER_PUBLIC: &str = "Public address (STUN): ";
pub const MSG_DISCOVER_GATEWAY: &str = "Gateway mapping: ";
pub const MSG_NONE: &str = "none";
pub const MSG_DISABLED: &str = "disabled";

pub const ERR_BIND: &str = "Failed to bind ";
pub const ERR_NO_CANDIDATES: &str = "No relay addresses to try (use --peer or --known)";
pub const ERR_TRANSFER: &str = "Transfer failed: ";
pub const ERR_TRANSFER_CANCELLED: &str = "Transfer cancelled";

pub const WARN_MAPPING_REMOVE_FAILED: &str = "Failed to remove gateway mapping: ";
