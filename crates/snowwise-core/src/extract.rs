//! Table-reference extraction.
//!
//! The keyword scanner is a hint generator, not a parser: it returns the token
//! that follows each `FROM` / `JOIN`. Subqueries, CTE names, quoted identifiers
//! containing spaces and `EXTRACT(... FROM col)` all leak through or get
//! skipped. Callers tolerate lookups that fail.

/// Pluggable so a real SQL parser can replace the scanner.
pub trait TableExtractor: Send + Sync {
    /// Referenced table names, deduplicated, in order of first appearance.
    fn extract(&self, sql: &str) -> Vec<String>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordExtractor;

impl TableExtractor for KeywordExtractor {
    fn extract(&self, sql: &str) -> Vec<String> {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let mut tables: Vec<String> = Vec::new();

        for (i, word) in words.iter().enumerate() {
            if !(word.eq_ignore_ascii_case("FROM") || word.eq_ignore_ascii_case("JOIN")) {
                continue;
            }
            let Some(next) = words.get(i + 1) else {
                continue;
            };
            // Subquery: nothing to name.
            if next.starts_with('(') {
                continue;
            }
            let token = next.trim_end_matches([',', ';', ')']);
            if token.is_empty() {
                continue;
            }
            if !tables.iter().any(|t| t.eq_ignore_ascii_case(token)) {
                tables.push(token.to_string());
            }
        }
        tables
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn set(v: Vec<String>) -> HashSet<String> {
        v.into_iter().collect()
    }

    #[test]
    fn aliases_are_excluded() {
        let got = KeywordExtractor.extract("SELECT * FROM orders o JOIN customers c ON o.cid = c.id");
        assert_eq!(
            set(got),
            HashSet::from(["orders".to_string(), "customers".to_string()])
        );
    }

    #[test]
    fn keywords_are_case_insensitive_and_deduplicated() {
        let got = KeywordExtractor.extract(
            "select a from SALES.PUBLIC.ORDERS left join sales.public.orders x on 1=1 Join items;",
        );
        assert_eq!(got, vec!["SALES.PUBLIC.ORDERS".to_string(), "items".to_string()]);
    }

    #[test]
    fn subqueries_are_skipped() {
        let got = KeywordExtractor.extract("SELECT * FROM (SELECT id FROM users) u");
        assert_eq!(got, vec!["users".to_string()]);
    }

    #[test]
    fn trailing_keyword_without_table() {
        assert!(KeywordExtractor.extract("SELECT 1 FROM").is_empty());
        assert!(KeywordExtractor.extract("SELECT 1").is_empty());
    }
}
