//! Deterministic names for objects the operator creates

const MAX_NAME_PREFIX: usize = 40;

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256, stable across toolchains, so it can name persisted objects.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Module name shortened so that generated names stay within DNS limits
pub fn name_prefix(name: &str) -> &str {
    let end = name
        .char_indices()
        .nth(MAX_NAME_PREFIX)
        .map_or(name.len(), |(i, _)| i);
    name[..end].trim_end_matches(['-', '.'])
}
