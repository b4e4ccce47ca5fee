//! Quorum arithmetic shared by the message queue and the vote counter.

pub(crate) fn is_majority(
    num: usize,
    total: usize,
) -> bool {
    num > total / 2
}

pub fn majority_count(total_nodes: usize) -> usize {
    (total_nodes / 2) + 1
}

/// The value acknowledged by a majority: the k-th largest of the voters'
/// watermarks where k = floor(N/2)+1. Used both for the replicated-index
/// watermark and for lease expirations (the latest instant some majority
/// has granted). With an empty slice there is no quorum: `None`.
pub(crate) fn majority_watermark<T: Ord + Copy>(values: &[T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    // k-th largest == element at len - k once ascending-sorted.
    let k = majority_count(sorted.len());
    Some(sorted[sorted.len() - k])
}
