use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Trimmed-mean latency for one candidate address.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatedResult {
    pub ip: Ipv4Addr,
    pub delay_ms: u64,
}

impl AggregatedResult {
    pub fn new(ip: Ipv4Addr, delay_ms: u64) -> Self {
        Self { ip, delay_ms }
    }
}

/// Ranked shortlist plus the run counters, as written by the JSON formatter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RankedReport {
    pub generated_at: String,
    pub total_candidates: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub entries: Vec<AggregatedResult>,
}
