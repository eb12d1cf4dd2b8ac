//! Optional AI pre-processing stage.
//!
//! A pure function over the command string, applied before dispatch when
//! the requester sets `use_ai`: validate the command for risk, optionally
//! rewrite it, and enrich it with context. Backends are pluggable; the
//! built-in rule-based analyzer needs no network, while the HTTP backend
//! talks to an OpenAI-compatible API. Backend failures degrade gracefully
//! (dispatch the original command) unless the stage is configured as
//! mandatory.

mod openai;
mod rules;

pub use openai::OpenAiBackend;
pub use rules::RuleBasedBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Risk classification for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unknown,
}

/// Safety assessment of a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandValidation {
    /// Whether the command is considered safe to execute
    pub safe: bool,
    pub risk_level: RiskLevel,
    /// Identified risks, human-readable
    #[serde(default)]
    pub risks: Vec<String>,
    /// Safer alternatives or improvements
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Proposed rewrite of a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOptimization {
    pub optimized_command: String,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Context attached to a command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandEnrichment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub side_effects: Vec<String>,
}

/// Full pre-processing report for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAnalysis {
    pub original_command: String,
    /// The command to dispatch (may equal the original)
    pub processed_command: String,
    pub validation: CommandValidation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<CommandOptimization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<CommandEnrichment>,
}

/// A pre-processing backend.
#[async_trait]
pub trait AiBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Analyze a command for the given target system and execution context.
    async fn analyze(&self, command: &str, system: &str, context: &str)
        -> Result<CommandAnalysis>;
}

/// Policy knobs for the pre-processing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiPolicy {
    /// Transition commands judged unsafe straight to Failed without
    /// dispatch.
    pub reject_unsafe: bool,
    /// When true, a backend failure fails the command instead of
    /// dispatching the original.
    pub mandatory: bool,
}

impl Default for AiPolicy {
    fn default() -> Self {
        Self {
            reject_unsafe: true,
            mandatory: false,
        }
    }
}

/// What the router should do after pre-processing.
#[derive(Debug)]
pub enum Preprocessed {
    /// Dispatch this command text (analysis attached when the stage ran).
    Dispatch {
        command: String,
        analysis: Option<CommandAnalysis>,
    },
    /// Do not dispatch; fail with the attached validation report.
    Reject { analysis: CommandAnalysis },
    /// Mandatory stage failed; fail the command with this reason.
    Fail { reason: String },
}

/// Drives a backend under the configured policy.
pub struct AiManager {
    backend: Option<Arc<dyn AiBackend>>,
    policy: AiPolicy,
}

impl AiManager {
    pub fn new(backend: Option<Arc<dyn AiBackend>>, policy: AiPolicy) -> Self {
        Self { backend, policy }
    }

    /// A manager with no backend: `use_ai` degrades to a pass-through.
    pub fn disabled() -> Self {
        Self::new(None, AiPolicy::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Run the analysis without any dispatch decision (the `/analyze`
    /// surface).
    pub async fn analyze(
        &self,
        command: &str,
        system: &str,
        context: &str,
    ) -> Result<CommandAnalysis> {
        match &self.backend {
            Some(backend) => backend.analyze(command, system, context).await,
            None => Err(Error::AiBackend("no AI backend configured".to_string())),
        }
    }

    /// Pre-process a command for dispatch, applying the degrade/reject
    /// policy.
    pub async fn preprocess(&self, command: &str, system: &str, context: &str) -> Preprocessed {
        let backend = match &self.backend {
            Some(backend) => backend,
            None => {
                if self.policy.mandatory {
                    return Preprocessed::Fail {
                        reason: "AI pre-processing is mandatory but no backend is configured"
                            .to_string(),
                    };
                }
                warn!("use_ai requested but no backend configured, dispatching original command");
                return Preprocessed::Dispatch {
                    command: command.to_string(),
                    analysis: None,
                };
            }
        };

        match backend.analyze(command, system, context).await {
            Ok(analysis) => {
                if !analysis.validation.safe && self.policy.reject_unsafe {
                    return Preprocessed::Reject { analysis };
                }
                Preprocessed::Dispatch {
                    command: analysis.processed_command.clone(),
                    analysis: Some(analysis),
                }
            }
            Err(e) => {
                if self.policy.mandatory {
                    Preprocessed::Fail {
                        reason: format!("AI pre-processing failed: {e}"),
                    }
                } else {
                    warn!(backend = backend.name(), error = %e, "AI backend failed, dispatching original command");
                    Preprocessed::Dispatch {
                        command: command.to_string(),
                        analysis: None,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBackend;

    #[async_trait]
    impl AiBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn analyze(&self, _: &str, _: &str, _: &str) -> Result<CommandAnalysis> {
            Err(Error::AiBackend("backend unreachable".to_string()))
        }
    }

    fn manager(backend: Option<Arc<dyn AiBackend>>, policy: AiPolicy) -> AiManager {
        AiManager::new(backend, policy)
    }

    #[tokio::test]
    async fn test_no_backend_degrades_to_passthrough() {
        let ai = AiManager::disabled();
        match ai.preprocess("echo hi", "Linux", "test").await {
            Preprocessed::Dispatch { command, analysis } => {
                assert_eq!(command, "echo hi");
                assert!(analysis.is_none());
            }
            other => panic!("expected Dispatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_backend_with_mandatory_fails() {
        let ai = manager(
            None,
            AiPolicy {
                reject_unsafe: true,
                mandatory: true,
            },
        );
        assert!(matches!(
            ai.preprocess("echo hi", "Linux", "test").await,
            Preprocessed::Fail { .. }
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_by_default() {
        let ai = manager(Some(Arc::new(FailingBackend)), AiPolicy::default());
        match ai.preprocess("echo hi", "Linux", "test").await {
            Preprocessed::Dispatch { command, .. } => assert_eq!(command, "echo hi"),
            other => panic!("expected Dispatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backend_failure_with_mandatory_fails() {
        let ai = manager(
            Some(Arc::new(FailingBackend)),
            AiPolicy {
                reject_unsafe: true,
                mandatory: true,
            },
        );
        assert!(matches!(
            ai.preprocess("echo hi", "Linux", "test").await,
            Preprocessed::Fail { .. }
        ));
    }

    #[tokio::test]
    async fn test_unsafe_command_rejected_under_policy() {
        let ai = manager(Some(Arc::new(RuleBasedBackend::new())), AiPolicy::default());
        match ai.preprocess("rm -rf /", "Linux", "test").await {
            Preprocessed::Reject { analysis } => {
                assert!(!analysis.validation.safe);
                assert_eq!(analysis.validation.risk_level, RiskLevel::High);
            }
            other => panic!("expected Reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsafe_command_dispatched_when_reject_disabled() {
        let ai = manager(
            Some(Arc::new(RuleBasedBackend::new())),
            AiPolicy {
                reject_unsafe: false,
                mandatory: false,
            },
        );
        assert!(matches!(
            ai.preprocess("rm -rf /", "Linux", "test").await,
            Preprocessed::Dispatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_analyze_without_backend_errors() {
        let ai = AiManager::disabled();
        assert!(matches!(
            ai.analyze("echo hi", "Linux", "test").await,
            Err(Error::AiBackend(_))
        ));
    }
}
