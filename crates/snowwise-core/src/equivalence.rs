use crate::model::ResultSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Equivalence {
    Match,
    /// Description of the first difference found.
    Mismatch(String),
}

impl Equivalence {
    pub fn is_match(&self) -> bool {
        matches!(self, Equivalence::Match)
    }
}

/// Structural, row-order-sensitive comparison.
///
/// Column names compare exactly: Snowflake upper-cases unquoted identifiers
/// and keeps quoted ones, so `"total"` and `TOTAL` are different columns.
/// Rows are never sorted: a reordering is reported as a mismatch.
/// Result sets without a header are compared by position.
pub fn compare_result_sets(original: &ResultSet, optimized: &ResultSet) -> Equivalence {
    if original.columns.len() != optimized.columns.len() {
        return Equivalence::Mismatch(format!(
            "column count differs: {} vs {}",
            original.columns.len(),
            optimized.columns.len()
        ));
    }
    for (i, (a, b)) in original
        .columns
        .iter()
        .zip(optimized.columns.iter())
        .enumerate()
    {
        if a != b {
            return Equivalence::Mismatch(format!("column {} differs: {} vs {}", i, a, b));
        }
    }
    if original.rows.len() != optimized.rows.len() {
        return Equivalence::Mismatch(format!(
            "row count differs: {} vs {}",
            original.rows.len(),
            optimized.rows.len()
        ));
    }
    for (r, (row_a, row_b)) in original.rows.iter().zip(optimized.rows.iter()).enumerate() {
        if row_a.len() != row_b.len() {
            return Equivalence::Mismatch(format!(
                "row {} width differs: {} vs {}",
                r,
                row_a.len(),
                row_b.len()
            ));
        }
        for (c, (va, vb)) in row_a.iter().zip(row_b.iter()).enumerate() {
            if va != vb {
                let column = original
                    .columns
                    .get(c)
                    .cloned()
                    .unwrap_or_else(|| format!("#{}", c + 1));
                return Equivalence::Mismatch(format!(
                    "row {} column {} differs: {} vs {}",
                    r, column, va, vb
                ));
            }
        }
    }
    Equivalence::Match
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rs(columns: &[&str], rows: Vec<Vec<serde_json::Value>>) -> ResultSet {
        ResultSet::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    #[test]
    fn identical_sets_match() {
        let a = rs(&["ID", "TOTAL"], vec![vec![json!("1"), json!("10.5")], vec![json!("2"), json!(null)]]);
        assert_eq!(compare_result_sets(&a, &a.clone()), Equivalence::Match);
    }

    #[test]
    fn reordered_rows_are_a_mismatch() {
        let a = rs(&["ID"], vec![vec![json!("1")], vec![json!("2")]]);
        let b = rs(&["ID"], vec![vec![json!("2")], vec![json!("1")]]);
        let got = compare_result_sets(&a, &b);
        assert!(!got.is_match());
        assert_eq!(got, Equivalence::Mismatch("row 0 column ID differs: \"1\" vs \"2\"".into()));
    }

    #[test]
    fn reordered_columns_are_a_mismatch() {
        let a = rs(&["ID", "NAME"], vec![]);
        let b = rs(&["NAME", "ID"], vec![]);
        assert!(!compare_result_sets(&a, &b).is_match());
    }

    #[test]
    fn same_row_count_is_not_enough() {
        let a = rs(&["N"], vec![vec![json!("1")]]);
        let b = rs(&["N"], vec![vec![json!("9")]]);
        assert!(!compare_result_sets(&a, &b).is_match());
    }

    #[test]
    fn quoted_and_unquoted_columns_differ() {
        let a = rs(&["total"], vec![vec![json!("3")]]);
        let b = rs(&["TOTAL"], vec![vec![json!("3")]]);
        assert_eq!(
            compare_result_sets(&a, &b),
            Equivalence::Mismatch("column 0 differs: total vs TOTAL".into())
        );
    }

    #[test]
    fn headerless_rows_compare_by_position() {
        let a = rs(&[], vec![vec![json!("1"), json!("x")]]);
        let b = rs(&[], vec![vec![json!("1"), json!("y")]]);
        assert_eq!(
            compare_result_sets(&a, &b),
            Equivalence::Mismatch("row 0 column #2 differs: \"x\" vs \"y\"".into())
        );
        assert!(compare_result_sets(&a, &a.clone()).is_match());
    }

    #[test]
    fn null_is_not_empty_string() {
        let a = rs(&["X"], vec![vec![json!(null)]]);
        let b = rs(&["X"], vec![vec![json!("")]]);
        assert!(!compare_result_sets(&a, &b).is_match());
    }
}
