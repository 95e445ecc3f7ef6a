use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use thiserror::Error;

/// Default width of one sampling sub-range.
pub const DEFAULT_SAMPLE_WINDOW: u32 = 0xff;

/// One accepted line of the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A bare address, probed as-is.
    Single(Ipv4Addr),
    /// A block, expanded by stratified sampling.
    Block(Ipv4Net),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("not a CIDR or IP: {0}")]
    Malformed(String),
    #[error("not IPv4: {0}")]
    NotIpv4(String),
}

/// A target line that was skipped, kept so the caller can report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    pub line_no: usize,
    pub text: String,
    pub reason: String,
}

/// Expanded and shuffled candidate list for one run.
#[derive(Debug, Default)]
pub struct CandidateSet {
    pub candidates: Vec<Ipv4Addr>,
    pub rejected: Vec<RejectedLine>,
}

/// Parse a single `a.b.c.d/n` or bare IPv4 line.
pub fn parse_target(line: &str) -> Result<Target, TargetError> {
    let line = line.trim();
    if let Ok(ip) = line.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(Target::Single(v4)),
            IpAddr::V6(_) => Err(TargetError::NotIpv4(line.to_string())),
        };
    }
    match line.parse::<IpNet>() {
        Ok(IpNet::V4(net)) => Ok(Target::Block(net.trunc())),
        Ok(IpNet::V6(_)) => Err(TargetError::NotIpv4(line.to_string())),
        Err(e) => Err(TargetError::Malformed(format!("{line}: {e}"))),
    }
}

/// Pick one random address per `window`-sized slice of the block, plus the
/// block's final address when the walk lands exactly on it.
///
/// The cursor starts at the network address and counts the remaining
/// addresses (0-based). Each step emits `base + 1 + r` with
/// `r` uniform in `0..min(remaining, window)`, so an emitted address never
/// leaves the block.
pub fn sample_block<R: Rng + ?Sized>(net: Ipv4Net, window: u32, rng: &mut R) -> Vec<Ipv4Addr> {
    let window = i64::from(window.max(1));
    let mut remaining = (1i64 << (32 - u32::from(net.prefix_len()))) - 1;
    let mut base = u64::from(u32::from(net.network()));

    let mut out = Vec::with_capacity((remaining / window + 2) as usize);
    while remaining >= 0 {
        let ip = if remaining == 0 {
            base
        } else {
            let span = remaining.min(window) as u64;
            base + 1 + rng.random_range(0..span)
        };
        // Never exceeds the block's last address, which is itself a u32.
        out.push(Ipv4Addr::from(ip as u32));
        remaining -= window;
        base += window as u64;
    }
    out
}

/// Expand one parsed target into its candidates.
pub fn expand_target<R: Rng + ?Sized>(target: Target, window: u32, rng: &mut R) -> Vec<Ipv4Addr> {
    match target {
        Target::Single(ip) => vec![ip],
        Target::Block(net) => sample_block(net, window, rng),
    }
}

/// Parse target file content, expand every valid line in input order, then
/// shuffle the combined list so probe load is spread across blocks.
///
/// Blank lines and `#` comments are ignored. Invalid lines are collected in
/// `rejected` and do not stop the expansion.
pub fn build_candidates<R: Rng + ?Sized>(content: &str, window: u32, rng: &mut R) -> CandidateSet {
    let mut set = CandidateSet::default();

    for (idx, raw_line) in content.lines().enumerate() {
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        match parse_target(line) {
            Ok(target) => set.candidates.extend(expand_target(target, window, rng)),
            Err(e) => set.rejected.push(RejectedLine {
                line_no: idx + 1,
                text: line.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    set.candidates.shuffle(rng);
    set
}

/// Read the target file. Failing to read it is a startup error.
pub fn load_targets_from_path(path: impl AsRef<Path>) -> Result<String> {
    fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to open cidr file: {}", path.as_ref().display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn slash_32_yields_its_only_address() {
        let mut rng = StdRng::seed_from_u64(1);
        let ips = sample_block(net("10.0.0.7/32"), 255, &mut rng);
        assert_eq!(ips, vec![Ipv4Addr::new(10, 0, 0, 7)]);
    }

    #[test]
    fn slash_32_line_expands_to_one_candidate() {
        let mut rng = StdRng::seed_from_u64(1);
        let set = build_candidates("10.0.0.7/32\n198.51.100.0/31\n", 255, &mut rng);
        let mut ips = set.candidates;
        ips.sort();
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(10, 0, 0, 7),
                Ipv4Addr::new(198, 51, 100, 1),
            ]
        );
    }

    #[test]
    fn slash_24_with_default_window_hits_one_host_and_broadcast() {
        let mut rng = StdRng::seed_from_u64(7);
        let ips = sample_block(net("192.0.2.0/24"), DEFAULT_SAMPLE_WINDOW, &mut rng);
        assert_eq!(ips.len(), 2);
        assert!(ips[0] > Ipv4Addr::new(192, 0, 2, 0));
        assert_eq!(ips[1], Ipv4Addr::new(192, 0, 2, 255));
    }

    #[test]
    fn host_bits_are_cleared_before_sampling() {
        assert_eq!(
            parse_target("1.1.1.5/24"),
            Ok(Target::Block(net("1.1.1.0/24")))
        );
    }

    #[test]
    fn top_of_address_space_does_not_wrap() {
        let mut rng = StdRng::seed_from_u64(3);
        let block = net("255.255.255.0/24");
        for ip in sample_block(block, 100, &mut rng) {
            assert!(block.contains(&ip), "{ip} escaped {block}");
        }
    }

    #[test]
    fn ipv6_is_rejected() {
        assert!(matches!(parse_target("::1"), Err(TargetError::NotIpv4(_))));
        assert!(matches!(
            parse_target("2606:4700::/32"),
            Err(TargetError::NotIpv4(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_target("10.0.0.0/33"),
            Err(TargetError::Malformed(_))
        ));
        assert!(matches!(
            parse_target("example.com"),
            Err(TargetError::Malformed(_))
        ));
    }
}
