use sha2::{Digest, Sha256};

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Stable identity of a query text.
///
/// Whitespace runs are collapsed and a trailing `;` dropped so the same
/// statement submitted by different clients fingerprints identically.
pub fn query_fingerprint(sql: &str) -> String {
    sha256_hex(&normalize_sql(sql))
}

pub fn normalize_sql(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_end_matches(';').trim_end().to_string()
}

/// First 12 hex chars, for display.
pub fn short(fp: &str) -> &str {
    &fp[..fp.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_and_terminator_do_not_change_fingerprint() {
        let a = query_fingerprint("SELECT *\n  FROM orders;");
        let b = query_fingerprint("SELECT * FROM orders");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(short(&a).len(), 12);
    }

    #[test]
    fn different_queries_differ() {
        assert_ne!(
            query_fingerprint("SELECT 1"),
            query_fingerprint("SELECT 2")
        );
    }
}
