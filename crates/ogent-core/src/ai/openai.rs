//! OpenAI-compatible HTTP backend for command pre-processing.
//!
//! Sends one chat-completion request in JSON mode and parses the combined
//! validation/optimization/enrichment report. Any transport or parse
//! failure surfaces as `Error::AiBackend`; the manager's policy decides
//! whether that degrades or fails the command.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{AiBackend, CommandAnalysis, CommandEnrichment, CommandOptimization, CommandValidation};
use crate::error::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str = "You are a security expert validating shell commands \
before execution on remote servers. Analyze the command for security risks, \
propose a safer or more efficient rewrite when one exists, and describe \
prerequisites and side effects. Respond with a JSON object with fields: \
safe (boolean), risk_level (low|medium|high), risks (array of strings), \
suggestions (array of strings), optimized_command (string), \
improvements (array of strings), prerequisites (array of strings), \
side_effects (array of strings).";

/// HTTP backend against an OpenAI-compatible chat-completions API.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Point at a different OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Shape the model is asked to produce.
#[derive(Deserialize)]
struct Report {
    safe: bool,
    risk_level: super::RiskLevel,
    #[serde(default)]
    risks: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    optimized_command: Option<String>,
    #[serde(default)]
    improvements: Vec<String>,
    #[serde(default)]
    prerequisites: Vec<String>,
    #[serde(default)]
    side_effects: Vec<String>,
}

#[async_trait]
impl AiBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn analyze(&self, command: &str, system: &str, context: &str)
        -> Result<CommandAnalysis> {
        let body = json!({
            "model": self.model,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": format!(
                    "Command: {command}\n\nTarget system: {system}\n\nExecution context: {context}"
                )},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::AiBackend(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::AiBackend(format!(
                "backend returned {status}: {detail}"
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::AiBackend(format!("invalid response body: {e}")))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| Error::AiBackend("response contained no choices".to_string()))?;

        let report: Report = serde_json::from_str(content)
            .map_err(|e| Error::AiBackend(format!("unparseable analysis: {e}")))?;

        debug!(model = %self.model, safe = report.safe, "AI analysis complete");

        let processed_command = report
            .optimized_command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| command.to_string());

        Ok(CommandAnalysis {
            original_command: command.to_string(),
            processed_command: processed_command.clone(),
            validation: CommandValidation {
                safe: report.safe,
                risk_level: report.risk_level,
                risks: report.risks,
                suggestions: report.suggestions,
            },
            optimization: report.optimized_command.map(|optimized_command| {
                CommandOptimization {
                    optimized_command,
                    improvements: report.improvements,
                    explanation: None,
                }
            }),
            enrichment: Some(CommandEnrichment {
                context: Some(format!("{system}: {context}")),
                prerequisites: report.prerequisites,
                side_effects: report.side_effects,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_parses_minimal_json() {
        let report: Report =
            serde_json::from_str(r#"{"safe": true, "risk_level": "low"}"#).unwrap();
        assert!(report.safe);
        assert!(report.risks.is_empty());
        assert!(report.optimized_command.is_none());
    }

    #[test]
    fn test_report_parses_full_json() {
        let report: Report = serde_json::from_str(
            r#"{
                "safe": false,
                "risk_level": "high",
                "risks": ["deletes data"],
                "suggestions": ["narrow the path"],
                "optimized_command": "rm -rf ./tmp",
                "improvements": ["scoped path"],
                "prerequisites": [],
                "side_effects": ["data loss"]
            }"#,
        )
        .unwrap();
        assert!(!report.safe);
        assert_eq!(report.optimized_command.as_deref(), Some("rm -rf ./tmp"));
    }
}
