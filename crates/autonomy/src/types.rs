//! Shared identifier, timestamp, and money types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of micro-units in one whole unit of budget.
pub const MICROS_PER_UNIT: u64 = 1_000_000;

/// Stable identifier for an agent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new agent id from a string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current timestamp in milliseconds since Unix epoch.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Construct a timestamp from milliseconds since Unix epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Return the timestamp as milliseconds since Unix epoch.
    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Timestamp shifted forward by `millis`, saturating at the maximum.
    pub fn plus_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Render a micro-unit amount with its six implied decimals (`50.000000`).
pub fn format_micro(amount: u64) -> String {
    format!(
        "{}.{:06}",
        amount / MICROS_PER_UNIT,
        amount % MICROS_PER_UNIT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_micro_units_with_six_decimals() {
        assert_eq!(format_micro(50_000_000), "50.000000");
        assert_eq!(format_micro(1_234_567), "1.234567");
        assert_eq!(format_micro(7), "0.000007");
    }

    #[test]
    fn agent_id_serializes_as_plain_string() {
        let id = AgentId::from("agent-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"agent-1\"");
        assert_eq!(id.to_string(), "agent-1");
    }

    #[test]
    fn timestamp_addition_saturates() {
        let ts = Timestamp::from_millis(u64::MAX - 1);
        assert_eq!(ts.plus_millis(10).as_millis(), u64::MAX);
        assert_eq!(Timestamp::from(5).plus_millis(5).as_millis(), 10);
    }
}
