//! Intent classification and model selection
//!
//! Pure pattern matching, no model calls:
//! - `IntentRouter` decides what the user wants (greeting, help, generate, improve, explain)
//!   and how hard it looks (fast / balanced / deep tier)
//! - `ModelSelector` maps a request to a `[primary, fallback]` model pair
//!
//! Greeting and help are answered from canned templates and never reach a model.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the request is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Greeting,
    Help,
    #[default]
    Generate,
    Improve,
    Explain,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::Help => "help",
            Intent::Generate => "generate",
            Intent::Improve => "improve",
            Intent::Explain => "explain",
        }
    }

    /// Canned answer for intents that short-circuit the pipeline
    pub fn canned_response(&self) -> Option<&'static str> {
        match self {
            Intent::Greeting => Some(GREETING_RESPONSE),
            Intent::Help => Some(HELP_RESPONSE),
            _ => None,
        }
    }
}

/// Model size hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Small model, quick edits and lookups
    Fast,
    #[default]
    Balanced,
    /// Largest available model, architecture and tricky debugging
    Deep,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::Deep => "deep",
        }
    }
}

/// Classification result
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub tier: ModelTier,
    pub reasoning: String,
    pub confidence: f32,
}

pub const GREETING_RESPONSE: &str = "Hi! I'm your local coding assistant. \
Describe a function or module you want written, or point me at a file to improve.";

pub const HELP_RESPONSE: &str = "I can help with:\n\
- generating code: \"write a function that parses ISO dates\"\n\
- improving a file: \"improve src/utils.py: add error handling\" (optionally with a line range)\n\
- explaining code: \"explain what retry_with_backoff does\"\n\
Generated code is validated in a sandbox before it is proposed. Files are only written when auto-write is enabled.";

static IMPROVE_KEYWORDS: &[&str] = &[
    "improve", "refactor", "fix", "bug", "optimize", "optimise",
    "clean up", "cleanup", "simplify", "rewrite", "speed up",
    "add error handling", "add type hints", "make it faster",
];

static EXPLAIN_KEYWORDS: &[&str] = &[
    "explain", "what does", "how does", "why does", "walk me through",
    "what is", "describe",
];

static DEEP_KEYWORDS: &[&str] = &[
    "architecture", "design", "concurrency", "thread-safe", "security",
    "performance", "algorithm", "complex", "thorough", "distributed",
    "race condition", "deadlock",
];

static FAST_KEYWORDS: &[&str] = &[
    "quick", "simple", "small", "typo", "rename", "format", "one-liner",
    "trivial",
];

static GREETING_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|howdy|yo|greetings|good\s+(morning|afternoon|evening))(\s+there)?[\s!.,]*$")
        .expect("greeting pattern is valid")
});

static HELP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(/?help|what can you do|how do i use (this|you)|usage)\s*[?!.]*\s*$")
        .expect("help pattern is valid")
});

/// Keyword-based intent classifier
#[derive(Debug, Clone, Default)]
pub struct IntentRouter;

impl IntentRouter {
    pub fn new() -> Self {
        Self
    }

    /// Classify a request
    pub fn classify(&self, text: &str) -> Classification {
        if GREETING_PATTERN.is_match(text) {
            return Classification {
                intent: Intent::Greeting,
                tier: ModelTier::Fast,
                reasoning: "Greeting".to_string(),
                confidence: 1.0,
            };
        }

        if HELP_PATTERN.is_match(text) {
            return Classification {
                intent: Intent::Help,
                tier: ModelTier::Fast,
                reasoning: "Help request".to_string(),
                confidence: 1.0,
            };
        }

        let lower = text.to_lowercase();
        let tier = self.determine_tier(&lower);

        let improve_score = IMPROVE_KEYWORDS.iter().filter(|kw| lower.contains(*kw)).count();
        let explain_score = EXPLAIN_KEYWORDS.iter().filter(|kw| lower.contains(*kw)).count();

        let (intent, reasoning, confidence) = if improve_score > 0 && improve_score >= explain_score {
            (Intent::Improve, format!("Improvement keywords (score: {})", improve_score), 0.8)
        } else if explain_score > 0 {
            (Intent::Explain, format!("Explanation keywords (score: {})", explain_score), 0.8)
        } else {
            (Intent::Generate, "Default to code generation".to_string(), 0.6)
        };

        debug!("Classified '{}' as {} / {}", truncate(text, 60), intent.as_str(), tier.as_str());

        Classification {
            intent,
            tier,
            reasoning,
            confidence,
        }
    }

    fn determine_tier(&self, lower: &str) -> ModelTier {
        if DEEP_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            ModelTier::Deep
        } else if FAST_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            ModelTier::Fast
        } else {
            ModelTier::Balanced
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Concrete model pair chosen for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChoice {
    pub primary: String,
    pub fallback: String,
    pub tier: ModelTier,
}

/// Model-selection port.
///
/// Must be safe for concurrent reads; the orchestration core never locks it.
pub trait ModelSelector: Send + Sync {
    fn select(&self, text: &str) -> ModelChoice;
}

/// Maps tiers to configured model ids
#[derive(Debug, Clone)]
pub struct KeywordModelSelector {
    router: IntentRouter,
    pub fast: String,
    pub balanced: String,
    pub deep: String,
    pub fallback: String,
}

impl KeywordModelSelector {
    pub fn new(fast: &str, balanced: &str, deep: &str, fallback: &str) -> Self {
        Self {
            router: IntentRouter::new(),
            fast: fast.to_string(),
            balanced: balanced.to_string(),
            deep: deep.to_string(),
            fallback: fallback.to_string(),
        }
    }

    /// One model for every tier
    pub fn single(primary: &str, fallback: &str) -> Self {
        Self::new(primary, primary, primary, fallback)
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast,
            ModelTier::Balanced => &self.balanced,
            ModelTier::Deep => &self.deep,
        }
    }
}

impl ModelSelector for KeywordModelSelector {
    fn select(&self, text: &str) -> ModelChoice {
        let tier = self.router.classify(text).tier;
        ModelChoice {
            primary: self.model_for(tier).to_string(),
            fallback: self.fallback.clone(),
            tier,
        }
    }
}
