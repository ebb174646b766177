//! Data shapes produced by the subconscious classifier (§4.6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Respond,
    Context,
    Drop,
}

impl std::str::FromStr for Classification {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "respond" => Ok(Classification::Respond),
            "context" => Ok(Classification::Context),
            "drop" => Ok(Classification::Drop),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            _ => Err(()),
        }
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityFlag {
    pub flag_type: String,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierResult {
    pub classification: Classification,
    pub confidence: f32,
    pub reason: String,
    pub security_flags: Vec<SecurityFlag>,
    pub implicit_mention: bool,
    pub topic: String,
    pub tone: String,
    pub model_used: String,
    pub latency_ms: u64,
    pub fallback_used: bool,
}

impl ClassifierResult {
    pub fn has_security_flags(&self) -> bool {
        !self.security_flags.is_empty()
    }

    pub fn should_auto_mute(&self) -> bool {
        self.security_flags.iter().any(|f| matches!(f.severity, Severity::High))
    }
}

/// Raw JSON shape the classifier prompt asks the model to return.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct RawClassification {
    #[serde(default)]
    pub classification: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub security_flags: Vec<RawSecurityFlag>,
    #[serde(default)]
    pub implicit_mention: bool,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub tone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawSecurityFlag {
    #[serde(default = "unknown_flag_type")]
    pub flag_type: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub description: String,
}

fn unknown_flag_type() -> String {
    "unknown".to_string()
}

/// Default fallback model rotation (§4.6). These are placeholders for the
/// free-tier models a deployment would actually configure; kept short so
/// a deployment with no configuration still has somewhere to start.
pub const DEFAULT_FALLBACK_MODELS: &[&str] = &[
    "fallback/model-a",
    "fallback/model-b",
    "fallback/model-c",
];
