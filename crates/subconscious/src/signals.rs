//! Cheap, API-free fallback classifier: a log-odds combination over a
//! handful of per-sender and per-channel features, used when the LLM
//! classifier times out or errors and channel history is available
//! (§4.6, "math classifier fallback").

use std::collections::HashMap;

use crate::models::Classification;

#[derive(Debug, Clone, Copy)]
pub struct AddressSignals {
    pub is_at_mention: bool,
    pub is_reply_to_agent: bool,
    pub is_in_agent_thread: bool,
}

/// Tracks, per sender, how often their messages have historically been
/// addressed to the agent versus background chatter. A fresh sender
/// starts at a neutral prior.
#[derive(Debug, Default)]
pub struct ChannelState {
    addressed_counts: HashMap<String, (u32, u32)>, // (addressed, total)
}

impl ChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sender_id: &str, was_addressed: bool) {
        let entry = self.addressed_counts.entry(sender_id.to_string()).or_insert((0, 0));
        entry.1 += 1;
        if was_addressed {
            entry.0 += 1;
        }
    }

    fn sender_prior(&self, sender_id: &str) -> f32 {
        match self.addressed_counts.get(sender_id) {
            Some((addressed, total)) if *total > 0 => {
                // Laplace-smoothed rate so a handful of observations don't
                // produce an overconfident 0.0 or 1.0.
                (*addressed as f32 + 1.0) / (*total as f32 + 2.0)
            }
            _ => 0.5,
        }
    }
}

/// Classifies via weighted log-odds over explicit address signals, an
/// `agent_name` word-boundary mention, and the sender's historical
/// addressed rate. Returns the classification, a confidence score in
/// `[0, 1]`, and the named feature contributions for diagnostics.
pub fn classify_with_state(
    content: &str,
    sender_id: &str,
    agent_name: &str,
    state: &ChannelState,
    signals: AddressSignals,
) -> (Classification, f32, HashMap<String, f32>) {
    let mut features = HashMap::new();

    let mentions_agent = mentions_word(content, agent_name);
    features.insert("mentions_agent".to_string(), if mentions_agent { 2.2 } else { 0.0 });
    features.insert("at_mention".to_string(), if signals.is_at_mention { 3.0 } else { 0.0 });
    features.insert("reply_to_agent".to_string(), if signals.is_reply_to_agent { 2.5 } else { 0.0 });
    features.insert("in_agent_thread".to_string(), if signals.is_in_agent_thread { 1.2 } else { 0.0 });

    let prior = state.sender_prior(sender_id);
    let prior_weight = (prior - 0.5) * 2.0;
    features.insert("sender_history".to_string(), prior_weight);

    let is_question = content.trim_end().ends_with('?');
    features.insert("is_question".to_string(), if is_question { 0.4 } else { 0.0 });

    let log_odds: f32 = features.values().sum::<f32>() - 1.5;
    let score = 1.0 / (1.0 + (-log_odds).exp());

    let classification = if score >= 0.6 {
        Classification::Respond
    } else if score <= 0.15 {
        Classification::Drop
    } else {
        Classification::Context
    };

    (classification, score, features)
}

fn mentions_word(text: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let pattern = format!(r"(?i)\b{}\b", regex::escape(word));
    regex::Regex::new(&pattern).map(|re| re.is_match(text)).unwrap_or(false)
}

/// Word-boundary regex match, used as the last-resort fallback when no
/// channel state is available at all.
pub fn mentions_agent_name(text: &str, agent_name: &str) -> bool {
    mentions_word(text, agent_name)
}
