use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Relay status of an outbox row. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Done,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOutboxStatus(pub String);

impl fmt::Display for UnknownOutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown outbox status: {}", self.0)
    }
}

impl std::error::Error for UnknownOutboxStatus {}

impl FromStr for OutboxStatus {
    type Err = UnknownOutboxStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "DONE" => Ok(OutboxStatus::Done),
            other => Err(UnknownOutboxStatus(other.to_string())),
        }
    }
}

/// OutboxMessage - one event captured in the same transaction as the
/// business mutation that produced it. The relay publishes the opaque
/// `content` payload and flips `status` to `Done`; rows are never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub id: i64,
    pub content: Vec<u8>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
