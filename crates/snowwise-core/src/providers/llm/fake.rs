use super::CompletionClient;
use crate::model::LlmResponse;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRule {
    /// Substring of the user prompt that selects this reply.
    #[serde(rename = "match")]
    pub needle: String,
    /// Optional substring the system prompt must contain as well.
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub reply: Option<String>,
    /// Fail the call instead of replying.
    #[serde(default)]
    pub error: Option<String>,
}

impl ScriptRule {
    fn matches(&self, system: &str, user: &str) -> bool {
        user.contains(&self.needle)
            && self.system.as_deref().map_or(true, |s| system.contains(s))
    }
}

/// Replies chosen by substring match on the prompts; first rule wins.
/// Unmatched prompts get `fallback`, or their own fenced SQL back when
/// `echo_unmatched` is set.
pub struct ScriptedCompletion {
    rules: Vec<ScriptRule>,
    fallback: Option<String>,
    echo_unmatched: bool,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: None,
            echo_unmatched: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct Script {
            #[serde(default)]
            rules: Vec<ScriptRule>,
            #[serde(default)]
            fallback: Option<String>,
            #[serde(default)]
            echo_unmatched: bool,
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read completion script {}: {}", path.display(), e))?;
        let script: Script = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse completion script {}: {}", path.display(), e))?;
        Ok(Self {
            rules: script.rules,
            fallback: script.fallback,
            echo_unmatched: script.echo_unmatched,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn reply(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push(ScriptRule {
            needle: needle.into(),
            system: None,
            reply: Some(reply.into()),
            error: None,
        });
        self
    }

    /// Like [`reply`](Self::reply) but only for calls whose system prompt
    /// contains `system`.
    pub fn reply_for(mut self, system: &str, needle: &str, reply: &str) -> Self {
        self.rules.push(ScriptRule {
            needle: needle.into(),
            system: Some(system.into()),
            reply: Some(reply.into()),
            error: None,
        });
        self
    }

    pub fn fail(mut self, needle: &str, error: &str) -> Self {
        self.rules.push(ScriptRule {
            needle: needle.into(),
            system: None,
            reply: None,
            error: Some(error.into()),
        });
        self
    }

    pub fn fail_for(mut self, system: &str, needle: &str, error: &str) -> Self {
        self.rules.push(ScriptRule {
            needle: needle.into(),
            system: Some(system.into()),
            reply: None,
            error: Some(error.into()),
        });
        self
    }

    pub fn echo_unmatched(mut self) -> Self {
        self.echo_unmatched = true;
        self
    }

    pub fn fallback(mut self, reply: &str) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedCompletion {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = match self.rules.iter().find(|r| r.matches(system, user)) {
            Some(ScriptRule { error: Some(e), .. }) => anyhow::bail!("{}", e),
            Some(ScriptRule { reply: Some(r), .. }) => r.clone(),
            _ => match (&self.fallback, self.echo_unmatched) {
                (Some(f), _) => f.clone(),
                (None, true) => crate::checker::fenced_block(user)
                    .ok_or_else(|| anyhow::anyhow!("no scripted completion and no SQL to echo"))?
                    .to_string(),
                (None, false) => anyhow::bail!("no scripted completion for prompt"),
            },
        };
        Ok(LlmResponse {
            text,
            provider: "fixture".into(),
            model: "scripted".into(),
            meta: serde_json::json!({}),
        })
    }

    fn provider_name(&self) -> &'static str {
        "fixture"
    }
}

/// Replies with the first fenced ```sql block of the prompt: a no-op
/// "optimizer" for offline runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoCompletion;

#[async_trait]
impl CompletionClient for EchoCompletion {
    async fn complete(&self, _system: &str, user: &str) -> anyhow::Result<LlmResponse> {
        let text = crate::checker::fenced_block(user)
            .ok_or_else(|| anyhow::anyhow!("echo: prompt has no ```sql block"))?;
        Ok(LlmResponse {
            text: text.to_string(),
            provider: "echo".into(),
            model: "echo".into(),
            meta: serde_json::json!({}),
        })
    }

    fn provider_name(&self) -> &'static str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let c = ScriptedCompletion::new()
            .reply("orders", "A")
            .reply("orders JOIN", "B")
            .fail("boom", "rate limited");
        assert_eq!(c.complete("", "FROM orders JOIN x").await.unwrap().text, "A");
        assert!(c.complete("", "boom").await.is_err());
        assert!(c.complete("", "nothing").await.is_err());
        assert_eq!(c.calls(), 3);
    }

    #[tokio::test]
    async fn system_scoped_rules_and_echo() {
        let c = ScriptedCompletion::new()
            .reply_for("performance", "orders", "```sql\nSELECT 2\n```")
            .echo_unmatched();
        let opt = c.complete("performance engineer", "```sql\nSELECT * FROM orders\n```").await.unwrap();
        assert_eq!(opt.text, "```sql\nSELECT 2\n```");
        let chk = c.complete("checker", "```sql\nSELECT * FROM orders\n```").await.unwrap();
        assert_eq!(chk.text, "SELECT * FROM orders");
    }

    #[tokio::test]
    async fn echo_returns_fenced_sql() {
        let r = EchoCompletion
            .complete("", "Optimize:\n```sql\nSELECT 1\n```")
            .await
            .unwrap();
        assert_eq!(r.text, "SELECT 1");
    }
}
