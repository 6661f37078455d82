/// SHA-256 hex digest of page content. Used for change detection and run-log
/// correlation, not for dedup (articles dedupe on URL).
pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
