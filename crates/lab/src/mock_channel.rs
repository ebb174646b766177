//! A channel adapter that lives entirely in memory, so a lab run can drive
//! the same dispatch path a real platform adapter would without talking to
//! any network (§4.9b).

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub content: String,
    pub sender_id: String,
    pub chat_id: String,
    pub display_name: String,
    pub username: String,
    pub is_reply_to_agent: bool,
    pub reply_to_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat_id: String,
    pub content: String,
}

/// Records injected inbound messages on a channel the agent loop consumes,
/// and captures outbound messages the loop sends back.
pub struct MockChannel {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound: Mutex<Vec<OutboundMessage>>,
    outbound_notify: Notify,
}

impl MockChannel {
    /// Returns the channel plus the receiver end an `AgentLoopStub` should
    /// be driven with.
    pub fn new() -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        (Self { inbound_tx, outbound: Mutex::new(Vec::new()), outbound_notify: Notify::new() }, inbound_rx)
    }

    pub async fn inject_message(&self, message: InboundMessage) {
        let _ = self.inbound_tx.send(message).await;
    }

    pub(crate) fn push_response(&self, message: OutboundMessage) {
        self.outbound.lock().expect("mock channel outbound lock poisoned").push(message);
        self.outbound_notify.notify_waiters();
    }

    pub fn clear_responses(&self) {
        self.outbound.lock().expect("mock channel outbound lock poisoned").clear();
    }

    pub fn get_responses(&self) -> Vec<OutboundMessage> {
        self.outbound.lock().expect("mock channel outbound lock poisoned").clone()
    }

    /// Waits up to `timeout` for at least one response to appear, returning
    /// the first one recorded since the last `clear_responses()`.
    pub async fn wait_for_response(&self, timeout: Duration) -> Option<OutboundMessage> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(first) = self.outbound.lock().expect("mock channel outbound lock poisoned").first().cloned() {
                    return first;
                }
                self.outbound_notify.notified().await;
            }
        })
        .await
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_response_times_out_when_nothing_arrives() {
        let (channel, _rx) = MockChannel::new();
        let response = channel.wait_for_response(Duration::from_millis(20)).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn wait_for_response_returns_once_pushed() {
        let (channel, _rx) = MockChannel::new();
        let channel = std::sync::Arc::new(channel);
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_for_response(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.push_response(OutboundMessage { chat_id: "c".to_string(), content: "hi".to_string() });
        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.content, "hi");
    }
}
