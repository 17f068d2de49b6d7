use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Plugin, ResolvePipeline, Resolver};
use crate::config::Config;
use crate::error::ResolveError;
use crate::http::{
    CookieJar, CookieMiddleware, GzipMiddleware, HeaderMiddleware, HttpClient, HttpRequest,
};
use crate::pipeline::extract::{find_shortened_urls, mentions_any};
use crate::pipeline::{compose, RetryPolicy};
use crate::platform::{ChatSender, DeliveryStatus, IncomingMessage};

const LABEL: &str = "redirection";

/// Follows a short link's redirects; the final URL is the whole answer, so
/// the landing page body is never downloaded.
pub struct RedirectResolver {
    http: HttpClient,
}

impl RedirectResolver {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Resolver for RedirectResolver {
    type Output = String;

    async fn resolve(&self, token: &str) -> Result<String, ResolveError> {
        let request = HttpRequest::get(&format!("http://{}", token))?.head_only();
        let response = self.http.fetch(request).await?;
        Ok(response.url.to_string())
    }
}

/// Watches for short links from known shorteners and replies with where
/// they lead.
pub struct UrlUnshortener {
    hosts: Vec<String>,
    pipeline: ResolvePipeline<String>,
}

impl UrlUnshortener {
    pub fn new(
        hosts: Vec<String>,
        resolver: Arc<dyn Resolver<Output = String>>,
        retry: RetryPolicy,
    ) -> Self {
        let hosts = hosts.into_iter().map(|h| h.to_lowercase()).collect();
        Self {
            hosts,
            pipeline: ResolvePipeline::new(resolver, retry),
        }
    }

    pub fn from_config(config: &Config, retry: RetryPolicy) -> Result<Self> {
        let jar = Arc::new(CookieJar::load(config.cookie_jar_path("shorteners")));
        let http = HttpClient::new(&config.http)?
            .with(HeaderMiddleware::from_config(&config.http, None)?)
            .with(GzipMiddleware::from_config(&config.http))
            .with(CookieMiddleware::new(jar));

        Ok(Self::new(
            config.plugins.unshortener.hosts.clone(),
            Arc::new(RedirectResolver::new(http)),
            retry,
        ))
    }
}

#[async_trait]
impl Plugin for UrlUnshortener {
    fn name(&self) -> &'static str {
        "url-unshortener"
    }

    async fn on_message_status(
        &self,
        message: &IncomingMessage,
        status: DeliveryStatus,
        chat: &dyn ChatSender,
    ) -> Result<()> {
        if status != DeliveryStatus::Received || !mentions_any(&message.body, &self.hosts) {
            return Ok(());
        }

        let tokens: Vec<String> = find_shortened_urls(&self.hosts, message.body.trim()).collect();
        if tokens.is_empty() {
            return Ok(());
        }

        let lines = self.pipeline.resolve_all(tokens, message).await;
        if let Some(reply) = compose(LABEL, &lines) {
            chat.send(&message.conversation, &reply)
                .await
                .context("Failed to send redirection reply")?;
        }
        Ok(())
    }
}
