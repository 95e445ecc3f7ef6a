use crate::types::AggregatedResult;

/// Sort ascending by delay and keep the first `head` entries.
///
/// `head <= 0` keeps everything. Order among equal delays is unspecified.
pub fn rank(mut results: Vec<AggregatedResult>, head: i64) -> Vec<AggregatedResult> {
    results.sort_unstable_by_key(|r| r.delay_ms);
    if head > 0 {
        results.truncate(usize::try_from(head).unwrap_or(usize::MAX));
    }
    results
}
