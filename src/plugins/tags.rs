use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CommandTable, Plugin};
use crate::platform::{ChatSender, DeliveryStatus, IncomingMessage};

const SEPARATOR: &str = "[x]";
const LABEL: &str = "Tags: ";

/// FIFO list that drops its oldest entry once it is full.
#[derive(Debug, Clone)]
pub struct BoundedList<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedList<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagCommand {
    Add,
    Show,
}

/// Collects `text [x]` tags from the chat and lists the most recent ones on
/// request.
pub struct TagList {
    commands: CommandTable<TagCommand>,
    tags: Mutex<BoundedList<String>>,
}

impl TagList {
    pub fn new(limit: usize) -> Self {
        Self {
            commands: CommandTable::new()
                .register(SEPARATOR, TagCommand::Add)
                .register("!tags", TagCommand::Show)
                .register("!жепки", TagCommand::Show),
            tags: Mutex::new(BoundedList::new(limit)),
        }
    }

    /// Every piece before the last separator becomes a tag.
    fn add(&self, body: &str) {
        let mut pieces: Vec<&str> = body.split(SEPARATOR).map(str::trim).collect();
        pieces.pop();

        let mut tags = self.tags.lock();
        for piece in pieces.into_iter().filter(|p| !p.is_empty()) {
            tags.push(piece.to_string());
        }
    }

    fn render(&self) -> String {
        let tags = self.tags.lock();
        let mut reply = String::from(LABEL);
        for tag in tags.iter() {
            reply.push_str(tag);
            reply.push(' ');
            reply.push_str(SEPARATOR);
            reply.push(' ');
        }
        reply
    }
}

#[async_trait]
impl Plugin for TagList {
    fn name(&self) -> &'static str {
        "tags"
    }

    async fn on_message_status(
        &self,
        message: &IncomingMessage,
        status: DeliveryStatus,
        chat: &dyn ChatSender,
    ) -> Result<()> {
        if status != DeliveryStatus::Received {
            return Ok(());
        }

        for command in self.commands.matching(&message.body) {
            if command == TagCommand::Add {
                self.add(&message.body);
            }
            let reply = self.render();
            chat.send(&message.conversation, &reply)
                .await
                .context("Failed to send tag list")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::*;

    async fn feed(plugin: &TagList, chat: &RecordingChat, body: &str) {
        plugin
            .on_message_status(&message(body), DeliveryStatus::Received, chat)
            .await
            .unwrap();
    }

    #[test]
    fn test_bounded_list_evicts_oldest() {
        let mut list = BoundedList::new(2);
        list.push(1);
        list.push(2);
        list.push(3);

        assert_eq!(list.len(), 2);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_bounded_list_zero_capacity_stays_empty() {
        let mut list = BoundedList::new(0);
        list.push("a");
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_add_then_show() {
        let plugin = TagList::new(20);
        let chat = RecordingChat::default();

        feed(&plugin, &chat, "rust [x] tokio [x] trailing").await;
        feed(&plugin, &chat, "!tags").await;

        let replies = chat.replies().await;
        assert_eq!(replies[0], "Tags: rust [x] tokio [x] ");
        assert_eq!(replies[1], replies[0]);
    }

    #[tokio::test]
    async fn test_empty_pieces_are_skipped() {
        let plugin = TagList::new(20);
        let chat = RecordingChat::default();

        feed(&plugin, &chat, "[x] [x]   [x]").await;

        assert_eq!(chat.replies().await, vec!["Tags: "]);
    }

    #[tokio::test]
    async fn test_limit_keeps_newest_tags() {
        let plugin = TagList::new(2);
        let chat = RecordingChat::default();

        feed(&plugin, &chat, "a [x] b [x] c [x]").await;

        assert_eq!(chat.replies().await, vec!["Tags: b [x] c [x] "]);
    }

    #[tokio::test]
    async fn test_add_and_show_in_one_message_both_fire() {
        let plugin = TagList::new(20);
        let chat = RecordingChat::default();

        feed(&plugin, &chat, "cats [x] !tags").await;

        assert_eq!(
            chat.replies().await,
            vec!["Tags: cats [x] ", "Tags: cats [x] "]
        );
    }

    #[tokio::test]
    async fn test_cyrillic_trigger_and_other_statuses() {
        let plugin = TagList::new(20);
        let chat = RecordingChat::default();

        plugin
            .on_message_status(&message("!жепки"), DeliveryStatus::Sent, &chat)
            .await
            .unwrap();
        assert!(chat.replies().await.is_empty());

        feed(&plugin, &chat, "покажи !жепки").await;
        assert_eq!(chat.replies().await, vec!["Tags: "]);
    }

    #[tokio::test]
    async fn test_unrelated_message_is_ignored() {
        let plugin = TagList::new(20);
        let chat = RecordingChat::default();

        feed(&plugin, &chat, "just chatting").await;

        assert!(chat.replies().await.is_empty());
    }
}
