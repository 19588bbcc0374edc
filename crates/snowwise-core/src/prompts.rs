use crate::model::{ExpenseMetric, TableSchema};

pub const CHECKER_SYSTEM: &str =
    "You are a helpful AI assistant that checks and optimizes Snowflake SQL queries.";

pub const OPTIMIZER_SYSTEM: &str = "You are a Snowflake performance engineer. \
You only rewrite read-only SELECT queries and never change what a query returns: \
the rewritten query must produce the same columns, in the same order, with the same rows in the same order.";

const CHECKLIST: &[&str] = &[
    "Using NOT IN with NULL values",
    "Using UNION when UNION ALL should have been used",
    "Using BETWEEN for exclusive ranges",
    "Data type mismatch in predicates",
    "Properly quoting identifiers",
    "Using the correct number of arguments for functions",
    "Casting to the correct data type",
    "Using the proper columns for joins",
];

pub fn checker_prompt(query: &str) -> String {
    let items: Vec<String> = CHECKLIST.iter().map(|i| format!("- {}", i)).collect();
    format!(
        "Double check the Snowflake SQL query below for common mistakes, including:\n\
         {}\n\n\
         If there are any of the above mistakes, rewrite the query. \
         If there are no mistakes, just reproduce the original query.\n\
         Output the final SQL query only, in a single ```sql block.\n\n\
         ```sql\n{}\n```",
        items.join("\n"),
        query.trim()
    )
}

pub fn optimization_prompt(query: &str, schemas: &[TableSchema], metric: ExpenseMetric) -> String {
    let context = if schemas.is_empty() {
        "(no table schemas available)".to_string()
    } else {
        schemas
            .iter()
            .map(|s| format!("- {}", s.render()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Referenced tables:\n{}\n\n\
         Suggest an optimized version of the query below. The primary goal is to reduce {}.\n\
         Start with a short explanation of each change and the metric it targets \
         (execution time or bytes scanned), then give the complete rewritten query \
         in a single ```sql block.\n\n\
         ```sql\n{}\n```",
        context,
        metric_label(metric),
        query.trim()
    )
}

fn metric_label(metric: ExpenseMetric) -> &'static str {
    match metric {
        ExpenseMetric::ExecutionTime => "execution time",
        ExpenseMetric::BytesScanned => "bytes scanned",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnDef;

    #[test]
    fn checker_prompt_carries_checklist_and_query() {
        let p = checker_prompt("SELECT * FROM t WHERE id NOT IN (SELECT id FROM u)\n");
        assert!(p.contains("- Using NOT IN with NULL values"));
        assert!(p.contains("- Using the proper columns for joins"));
        assert!(p.ends_with("```sql\nSELECT * FROM t WHERE id NOT IN (SELECT id FROM u)\n```"));
    }

    #[test]
    fn optimization_prompt_renders_schemas() {
        let schema = TableSchema {
            name: "ORDERS".into(),
            columns: vec![ColumnDef {
                name: "ID".into(),
                data_type: "NUMBER(38,0)".into(),
            }],
        };
        let p = optimization_prompt("SELECT 1", &[schema], ExpenseMetric::BytesScanned);
        assert!(p.contains("- ORDERS(ID NUMBER(38,0))"));
        assert!(p.contains("reduce bytes scanned"));

        let empty = optimization_prompt("SELECT 1", &[], ExpenseMetric::ExecutionTime);
        assert!(empty.contains("(no table schemas available)"));
    }
}
