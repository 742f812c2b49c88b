use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Progress sink for node execution.
///
/// Notifications are best-effort and must never fail a node.
pub trait ProgressNotifier: Send + Sync {
    fn notify(&self, node_id: &NodeId, percent: u8, message: &str);
}

/// Discards every notification
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl ProgressNotifier for NoopNotifier {
    fn notify(&self, _node_id: &NodeId, _percent: u8, _message: &str) {}
}

/// Emits notifications as tracing events
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl ProgressNotifier for TracingNotifier {
    fn notify(&self, node_id: &NodeId, percent: u8, message: &str) {
        tracing::info!(node_id = %node_id, percent, "{}", message);
    }
}

/// A single progress notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub node_id: NodeId,
    pub percent: u8,
    pub message: String,
}

/// Forwards notifications over a channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressNotifier for ChannelNotifier {
    fn notify(&self, node_id: &NodeId, percent: u8, message: &str) {
        // receiver gone: nobody is listening any more
        let _ = self.sender.send(ProgressEvent {
            node_id: node_id.clone(),
            percent: percent.min(100),
            message: message.to_string(),
        });
    }
}
