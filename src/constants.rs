/// File name used by [`crate::storage::FileMetaStore`] when pointed at a
/// tablet directory.
pub const CONSENSUS_META_FILENAME: &str = "consensus-meta";

/// Term value a round carries before it has been accepted anywhere.
pub(crate) const UNBOUND_TERM: u64 = 0;
