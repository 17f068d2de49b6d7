pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

/// A message received from any platform
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Platform-specific user ID as string
    pub sender_id: String,
    /// Display name of the user
    pub sender_display_name: String,
    /// The message text
    pub body: String,
    /// Platform-specific chat/channel ID as string
    pub conversation: String,
}

/// Where a message is in its delivery lifecycle when a plugin sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Received,
    Read,
}

/// Outbound half of a chat platform.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, conversation: &str, text: &str) -> Result<()>;
}
