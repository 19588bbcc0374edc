use crate::prompts;
use crate::providers::llm::CompletionClient;
use crate::providers::warehouse::read_only::first_unquoted_semicolon;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Sends a query through the correctness checklist and returns exactly one
/// statement back.
#[derive(Clone)]
pub struct QueryChecker {
    client: Arc<dyn CompletionClient>,
}

impl QueryChecker {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    pub async fn check(&self, query: &str) -> anyhow::Result<String> {
        let resp = self
            .client
            .complete(prompts::CHECKER_SYSTEM, &prompts::checker_prompt(query))
            .await?;
        extract_single_statement(&resp.text)
    }
}

/// Body of the first fenced code block, language tag removed. Only fences
/// opening a line count; inline mentions of ``` are prose.
pub fn fenced_block(text: &str) -> Option<&str> {
    let start = fences(text).next()?;
    let after = &text[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    let end = fences(body).next().unwrap_or(body.len());
    let block = body[..end].trim();
    (!block.is_empty()).then_some(block)
}

fn fences(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.match_indices("```").map(|(i, _)| i).filter(move |&i| {
        text[..i]
            .rsplit('\n')
            .next()
            .map_or(true, |line| line.trim().is_empty())
    })
}

/// Reduces free-form model output to a single SQL statement: fenced block if
/// present, leading prose dropped, cut at the first top-level `;`.
pub fn extract_single_statement(text: &str) -> anyhow::Result<String> {
    static SELECT: OnceLock<Regex> = OnceLock::new();
    static CTE: OnceLock<Regex> = OnceLock::new();
    let select_re = SELECT.get_or_init(|| Regex::new(r"(?i)\bselect\b").expect("static regex"));
    // WITH only opens a statement when a CTE definition follows it.
    let cte_re = CTE.get_or_init(|| {
        Regex::new(r#"(?i)\bwith\s+(?:recursive\s+)?(?:"[^"]+"|[a-z_][\w$]*)\s*(?:\([^()]*\)\s*)?as\s*\("#)
            .expect("static regex")
    });

    let candidate = fenced_block(text).unwrap_or(text);
    let start = [cte_re.find(candidate), select_re.find(candidate)]
        .into_iter()
        .flatten()
        .map(|m| m.start())
        .min()
        .ok_or_else(|| anyhow::anyhow!("completion contained no SELECT statement"))?;
    let stmt = &candidate[start..];
    let stmt = match first_unquoted_semicolon(stmt) {
        Some(i) => &stmt[..i],
        None => stmt,
    };
    let stmt = stmt.trim();
    if stmt.is_empty() {
        anyhow::bail!("completion produced an empty statement");
    }
    Ok(stmt.to_string())
}

/// Explanation text surrounding the fenced block, if any.
pub fn rationale(text: &str) -> Option<String> {
    let start = fences(text).next()?;
    let before = text[..start].trim();
    let after_open = &text[start + 3..];
    let after = fences(after_open)
        .next()
        .map(|i| after_open[i + 3..].trim())
        .unwrap_or("");
    let joined = [before, after]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n");
    (!joined.is_empty()).then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::llm::fake::ScriptedCompletion;

    #[test]
    fn fenced_sql_is_extracted() {
        let text = "Here you go:\n```sql\nSELECT id\nFROM orders;\n```\nDone.";
        assert_eq!(extract_single_statement(text).unwrap(), "SELECT id\nFROM orders");
    }

    #[test]
    fn leading_prose_is_dropped_without_fence() {
        let text = "The corrected query is: select a from t where b = 'x;y'; select 2";
        assert_eq!(
            extract_single_statement(text).unwrap(),
            "select a from t where b = 'x;y'"
        );
    }

    #[test]
    fn cte_is_kept_whole() {
        let text = "```\nWITH x AS (SELECT 1 AS n) SELECT n FROM x\n```";
        assert_eq!(
            extract_single_statement(text).unwrap(),
            "WITH x AS (SELECT 1 AS n) SELECT n FROM x"
        );
    }

    #[test]
    fn prose_with_is_not_a_cte() {
        let text = "Rewritten with the filter pushed down: SELECT a FROM t WHERE b = 1";
        assert_eq!(extract_single_statement(text).unwrap(), "SELECT a FROM t WHERE b = 1");

        let text = "Started with a CTE: with recursive r (n) as (select 1) select n from r";
        assert_eq!(
            extract_single_statement(text).unwrap(),
            "with recursive r (n) as (select 1) select n from r"
        );
    }

    #[test]
    fn inline_fence_mentions_are_ignored() {
        let prompt = crate::prompts::checker_prompt("SELECT a FROM t");
        assert_eq!(fenced_block(&prompt), Some("SELECT a FROM t"));
        assert_eq!(fenced_block("use a ```sql block"), None);
    }

    #[test]
    fn no_statement_is_an_error() {
        assert!(extract_single_statement("I cannot help with that.").is_err());
        assert!(extract_single_statement("").is_err());
    }

    #[test]
    fn rationale_surrounds_block() {
        let text = "Pushed the filter down to cut bytes scanned.\n```sql\nSELECT 1\n```\nAlso consider clustering.";
        assert_eq!(
            rationale(text).unwrap(),
            "Pushed the filter down to cut bytes scanned.\n\nAlso consider clustering."
        );
        assert_eq!(rationale("```sql\nSELECT 1\n```"), None);
        assert_eq!(rationale("SELECT 1"), None);
    }

    #[tokio::test]
    async fn checker_returns_single_statement() {
        let client = Arc::new(
            ScriptedCompletion::new().reply("NOT IN", "```sql\nSELECT a FROM t WHERE a IS NOT NULL;\nSELECT 2;\n```"),
        );
        let checker = QueryChecker::new(client);
        assert_eq!(
            checker.check("SELECT a FROM t").await.unwrap(),
            "SELECT a FROM t WHERE a IS NOT NULL"
        );
    }
}
