pub mod store;
pub mod tags;
pub mod unshortener;

use std::fmt::Display;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ResolveError;
use crate::pipeline::{with_retry, ReplyLine, ResolutionCache, RetryPolicy};
use crate::platform::{ChatSender, DeliveryStatus, IncomingMessage};

pub use store::StoreItemLookup;
pub use tags::TagList;
pub use unshortener::UrlUnshortener;

/// A chat plugin. Sees every message together with its delivery status and
/// replies through `chat` when it has something to say.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_message_status(
        &self,
        message: &IncomingMessage,
        status: DeliveryStatus,
        chat: &dyn ChatSender,
    ) -> Result<()>;
}

/// Turns one token into something worth reporting.
#[async_trait]
pub trait Resolver: Send + Sync {
    type Output;

    async fn resolve(&self, token: &str) -> Result<Self::Output, ResolveError>;
}

/// Ordered trigger -> command registry. A command fires whenever its
/// trigger appears anywhere in the message body, so one message can fire
/// several commands.
#[derive(Debug, Clone)]
pub struct CommandTable<C> {
    entries: Vec<(String, C)>,
}

impl<C: Copy> CommandTable<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(mut self, trigger: impl Into<String>, command: C) -> Self {
        self.entries.push((trigger.into(), command));
        self
    }

    /// Every command whose trigger is a substring of `body`, in registration order.
    pub fn matching(&self, body: &str) -> Vec<C> {
        self.entries
            .iter()
            .filter(|(trigger, _)| body.contains(trigger.as_str()))
            .map(|(_, command)| *command)
            .collect()
    }
}

impl<C: Copy> Default for CommandTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// `cache(retry(resolve))` for one kind of token.
pub struct ResolvePipeline<V> {
    resolver: Arc<dyn Resolver<Output = V>>,
    cache: ResolutionCache<V>,
    retry: RetryPolicy,
}

impl<V> ResolvePipeline<V>
where
    V: Clone + Display + Send + Sync,
{
    pub fn new(resolver: Arc<dyn Resolver<Output = V>>, retry: RetryPolicy) -> Self {
        Self {
            resolver,
            cache: ResolutionCache::new(),
            retry,
        }
    }

    pub async fn resolve(&self, token: &str) -> Result<V, ResolveError> {
        self.cache
            .get_or_compute(token, || {
                with_retry(&self.retry, || self.resolver.resolve(token))
            })
            .await
    }

    /// Resolve every token concurrently; lines come back in token order and
    /// one failing token never affects the others.
    pub async fn resolve_all(
        &self,
        tokens: Vec<String>,
        message: &IncomingMessage,
    ) -> Vec<ReplyLine> {
        let lookups = tokens.into_iter().map(|token| async move {
            info!("Resolving {} for {}", token, message.sender_id);
            let result = self.resolve(&token).await.map(|value| value.to_string());
            if let Err(e) = &result {
                error!(
                    "Unable to resolve {} for {} ({}): {}",
                    token, message.sender_display_name, message.sender_id, e
                );
            }
            ReplyLine::from_result(token, result)
        });
        let lines = join_all(lookups).await;
        debug!("{} cached resolutions", self.cache.len().await);
        lines
    }
}

/// Runs plugins for incoming messages on a bounded pool of tasks.
pub struct PluginHost {
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    chat: Arc<dyn ChatSender>,
    permits: Arc<Semaphore>,
    capacity: u32,
}

impl PluginHost {
    pub fn new(
        plugins: Vec<Arc<dyn Plugin>>,
        chat: Arc<dyn ChatSender>,
        max_concurrent: usize,
    ) -> Self {
        let capacity = max_concurrent.clamp(1, u32::MAX as usize) as u32;
        Self {
            plugins: Arc::new(plugins),
            chat,
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// Queue `message` for every plugin. Returns `None` once the host has
    /// been shut down.
    pub fn dispatch(
        &self,
        message: IncomingMessage,
        status: DeliveryStatus,
    ) -> Option<JoinHandle<()>> {
        if self.permits.is_closed() {
            warn!("Dropping message from {}: host is shut down", message.sender_id);
            return None;
        }

        let plugins = self.plugins.clone();
        let chat = self.chat.clone();
        let permits = self.permits.clone();
        let span = info_span!("dispatch", id = %Uuid::new_v4(), conversation = %message.conversation);

        Some(tokio::spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    debug!("Host shut down before message could run");
                    return;
                };
                for plugin in plugins.iter() {
                    if let Err(e) = plugin
                        .on_message_status(&message, status, chat.as_ref())
                        .await
                    {
                        error!("Plugin {} failed: {:#}", plugin.name(), e);
                    }
                }
            }
            .instrument(span),
        ))
    }

    /// Wait for running messages to finish, then refuse new ones.
    pub async fn shutdown(&self) {
        match self.permits.acquire_many(self.capacity).await {
            Ok(all) => all.forget(),
            Err(_) => return,
        }
        self.permits.close();
        info!("Plugin host stopped");
    }
}

/// Build every plugin enabled in `config`.
pub fn build(config: &Config) -> Result<Vec<Arc<dyn Plugin>>> {
    let retry = RetryPolicy::from_config(&config.retry);
    let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();

    if config.plugins.unshortener.enabled {
        plugins.push(Arc::new(UrlUnshortener::from_config(config, retry.clone())?));
    }
    if config.plugins.store.enabled {
        plugins.push(Arc::new(StoreItemLookup::from_config(config, retry.clone())?));
    }
    if config.plugins.tags.enabled {
        plugins.push(Arc::new(TagList::new(config.plugins.tags.limit)));
    }

    for plugin in &plugins {
        info!("Loaded plugin: {}", plugin.name());
    }
    Ok(plugins)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Records everything the plugins try to send.
    #[derive(Default)]
    pub struct RecordingChat {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingChat {
        pub async fn replies(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|(_, text)| text.clone()).collect()
        }
    }

    #[async_trait]
    impl ChatSender for RecordingChat {
        async fn send(&self, conversation: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((conversation.to_string(), text.to_string()));
            Ok(())
        }
    }

    /// Canned answers per token; unknown tokens fail with a 404.
    pub struct FakeResolver<V> {
        pub answers: HashMap<String, Result<V, fn() -> ResolveError>>,
        pub calls: AtomicUsize,
    }

    impl<V> FakeResolver<V> {
        pub fn new(answers: Vec<(&str, Result<V, fn() -> ResolveError>)>) -> Self {
            Self {
                answers: answers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<V: Clone + Send + Sync> Resolver for FakeResolver<V> {
        type Output = V;

        async fn resolve(&self, token: &str) -> Result<V, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.get(token) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(make)) => Err(make()),
                None => Err(ResolveError::Status {
                    status: 404,
                    url: format!("http://{}", token),
                }),
            }
        }
    }

    pub fn no_wait_retry() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    pub fn message(body: &str) -> IncomingMessage {
        IncomingMessage {
            sender_id: "42".to_string(),
            sender_display_name: "Tester".to_string(),
            body: body.to_string(),
            conversation: "chat-1".to_string(),
        }
    }
}
