//! Built-in rule-based analyzer.
//!
//! Pattern-matches commands against a catalog of destructive shell idioms.
//! No network, always available; the safety floor when no LLM backend is
//! configured.

use async_trait::async_trait;

use super::{
    AiBackend, CommandAnalysis, CommandEnrichment, CommandOptimization, CommandValidation,
    RiskLevel,
};
use crate::error::Result;

struct Rule {
    pattern: &'static str,
    risk_level: RiskLevel,
    risk: &'static str,
    suggestion: &'static str,
}

/// Substring rules, matched case-insensitively against the trimmed command.
const RULES: &[Rule] = &[
    Rule {
        pattern: "rm -rf /",
        risk_level: RiskLevel::High,
        risk: "recursive force-delete from the filesystem root",
        suggestion: "scope the delete to an explicit subdirectory",
    },
    Rule {
        pattern: "rm -fr /",
        risk_level: RiskLevel::High,
        risk: "recursive force-delete from the filesystem root",
        suggestion: "scope the delete to an explicit subdirectory",
    },
    Rule {
        pattern: "mkfs",
        risk_level: RiskLevel::High,
        risk: "formats a block device, destroying its contents",
        suggestion: "double-check the target device before formatting",
    },
    Rule {
        pattern: "dd if=",
        risk_level: RiskLevel::High,
        risk: "raw device write can destroy data irrecoverably",
        suggestion: "verify of= target and add status=progress",
    },
    Rule {
        pattern: ":(){ :|:& };:",
        risk_level: RiskLevel::High,
        risk: "fork bomb exhausts process table",
        suggestion: "do not run",
    },
    Rule {
        pattern: "> /dev/sd",
        risk_level: RiskLevel::High,
        risk: "redirect onto a raw disk device",
        suggestion: "write to a regular file instead",
    },
    Rule {
        pattern: "chmod -r 777 /",
        risk_level: RiskLevel::High,
        risk: "world-writable permissions from the filesystem root",
        suggestion: "restrict the path and the mode",
    },
    Rule {
        pattern: "shutdown",
        risk_level: RiskLevel::Medium,
        risk: "powers the host off",
        suggestion: "schedule with a delay (shutdown +5) so it can be cancelled",
    },
    Rule {
        pattern: "reboot",
        risk_level: RiskLevel::Medium,
        risk: "restarts the host",
        suggestion: "confirm no critical workload is running",
    },
    Rule {
        pattern: "iptables -f",
        risk_level: RiskLevel::Medium,
        risk: "flushes firewall rules",
        suggestion: "save current rules first (iptables-save)",
    },
];

/// Rule-driven [`AiBackend`].
pub struct RuleBasedBackend;

impl RuleBasedBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RuleBasedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiBackend for RuleBasedBackend {
    fn name(&self) -> &str {
        "rules"
    }

    async fn analyze(&self, command: &str, system: &str, context: &str)
        -> Result<CommandAnalysis> {
        let trimmed = command.trim();
        let haystack = trimmed.to_lowercase();

        let mut risk_level = RiskLevel::Low;
        let mut risks = Vec::new();
        let mut suggestions = Vec::new();
        let mut side_effects = Vec::new();

        for rule in RULES {
            if haystack.contains(rule.pattern) {
                if severity(rule.risk_level) > severity(risk_level) {
                    risk_level = rule.risk_level;
                }
                risks.push(rule.risk.to_string());
                suggestions.push(rule.suggestion.to_string());
                side_effects.push(rule.risk.to_string());
            }
        }

        let safe = risk_level != RiskLevel::High;

        let optimization = if trimmed != command {
            Some(CommandOptimization {
                optimized_command: trimmed.to_string(),
                improvements: vec!["removed surrounding whitespace".to_string()],
                explanation: None,
            })
        } else {
            None
        };

        Ok(CommandAnalysis {
            original_command: command.to_string(),
            processed_command: trimmed.to_string(),
            validation: CommandValidation {
                safe,
                risk_level,
                risks,
                suggestions,
            },
            optimization,
            enrichment: Some(CommandEnrichment {
                context: Some(format!("{system}: {context}")),
                prerequisites: Vec::new(),
                side_effects,
            }),
        })
    }
}

fn severity(level: RiskLevel) -> u8 {
    match level {
        RiskLevel::Low => 0,
        RiskLevel::Unknown => 1,
        RiskLevel::Medium => 2,
        RiskLevel::High => 3,
    }
}
