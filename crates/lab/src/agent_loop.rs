//! A minimal stand-in for the real outer agent loop (out of scope here):
//! pulls a message off the bus, classifies it, and on `Respond` sends back
//! a deterministic acknowledgement — enough to exercise start/inject/stop
//! and produce audit events end-to-end without implementing a real agent
//! (§4.9b).

use std::sync::Arc;

use halcyon_audit::AuditCollector;
use halcyon_subconscious::{Classification, Classifier, MessageMetadata};
use serde_json::json;
use tokio::sync::mpsc;

use crate::mock_channel::{InboundMessage, MockChannel, OutboundMessage};

pub struct AgentLoopStub {
    classifier: Arc<Classifier>,
    channel: Arc<MockChannel>,
    audit: Option<Arc<AuditCollector>>,
    agent_name: String,
}

impl AgentLoopStub {
    pub fn new(classifier: Arc<Classifier>, channel: Arc<MockChannel>, audit: Option<Arc<AuditCollector>>, agent_name: impl Into<String>) -> Self {
        Self { classifier, channel, audit, agent_name: agent_name.into() }
    }

    /// Drains `inbound` until the sender end is dropped (the harness's
    /// `stop()` aborts this task's handle instead of relying on that, so a
    /// lab run can be torn down even mid-classification).
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle(message).await;
        }
    }

    async fn handle(&self, message: InboundMessage) {
        let metadata = MessageMetadata {
            is_at_mention: false,
            is_reply_to_agent: message.is_reply_to_agent,
            is_in_agent_thread: message.reply_to_message_id.is_some(),
            is_stale: false,
            stale_minutes: None,
        };

        let result = self
            .classifier
            .classify(&message.content, &message.display_name, &message.sender_id, false, &metadata, None)
            .await;

        if let Some(audit) = &self.audit {
            if let serde_json::Value::Object(data) = json!({
                "classification": classification_label(result.classification),
                "confidence": result.confidence,
                "fallback_used": result.fallback_used,
            }) {
                audit.record_event("classification", &message.chat_id, data);
            }

            if let Some(context_block) = self.classifier.take_for_context().await {
                if let serde_json::Value::Object(data) = json!({ "block": context_block }) {
                    audit.record_event("context_injected", &message.chat_id, data);
                }
            }
        }

        if result.classification != Classification::Respond {
            return;
        }

        let preview: String = message.content.chars().take(80).collect();
        let response = OutboundMessage { chat_id: message.chat_id.clone(), content: format!("{} heard you: \"{}\"", self.agent_name, preview) };

        if let Some(audit) = &self.audit {
            if let serde_json::Value::Object(data) = json!({ "content": response.content.clone() }) {
                audit.record_event("response_sent", &message.chat_id, data);
            }
        }

        self.channel.push_response(response);
    }
}

fn classification_label(classification: Classification) -> &'static str {
    match classification {
        Classification::Respond => "respond",
        Classification::Context => "context",
        Classification::Drop => "drop",
    }
}
