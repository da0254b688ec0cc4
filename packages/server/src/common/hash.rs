use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a URL loc.
///
/// Used as the dedupe key for URL entries: `(project_id, loc_hash)` is unique
/// and the hash never changes for a given loc.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Change-detection hash for a sitemap's child list.
///
/// Hashes the sorted, trimmed set of child locs so the result is stable under
/// reordering and whitespace noise but changes whenever the set of children
/// changes.
pub fn content_hash<'a, I>(locs: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut normalized: Vec<&str> = locs
        .into_iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    normalized.sort_unstable();
    normalized.dedup();

    let mut hasher = Sha256::new();
    for loc in normalized {
        hasher.update(loc.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
