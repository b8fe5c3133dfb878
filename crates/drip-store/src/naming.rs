//! Collection naming.

/// Shared collection holding one metadata record per watched source.
pub const METADATA_COLLECTION: &str = "drip.metadata";

/// Prefix of every Persisted Change Stream collection.
pub const PCS_PREFIX: &str = "drip.pcs.";

/// Name of the Persisted Change Stream for `source`.
pub fn pcs_collection(source: &str) -> String {
    format!("{}{}", PCS_PREFIX, source)
}

/// The source a PCS collection belongs to, if `name` is one.
pub fn source_of_pcs(name: &str) -> Option<&str> {
    name.strip_prefix(PCS_PREFIX).filter(|s| !s.is_empty())
}
