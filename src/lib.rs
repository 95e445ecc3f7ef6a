//! Library crate for edgeping: CIDR sampling, HTTPS latency probing and ranking.
pub mod aggregate;
pub mod config;
pub mod iface;
pub mod output;
pub mod prober;
pub mod progress;
pub mod proxy;
pub mod rank;
pub mod sampler;
pub mod scheduler;
pub mod signal;
pub mod types;
