//! Subconscious: a fast pre-classification pass over inbound messages,
//! with a math-classifier and regex fallback when the LLM path is
//! unavailable (§4.6).

pub mod models;
pub mod processor;
pub mod signals;

pub use models::{ClassifierResult, Classification, SecurityFlag, Severity, DEFAULT_FALLBACK_MODELS};
pub use processor::{Classifier, MessageMetadata};
pub use signals::{classify_with_state, mentions_agent_name, AddressSignals, ChannelState};
