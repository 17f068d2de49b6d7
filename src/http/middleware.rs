use std::io::Read;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CACHE_CONTROL,
    CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, REFERER, USER_AGENT,
};

use super::{HttpRequest, HttpResponse};
use crate::config::HttpConfig;
use crate::error::ResolveError;

/// One link in the [`HttpClient`](super::HttpClient) chain.
pub trait Middleware: Send + Sync {
    fn on_request(&self, _request: &mut HttpRequest) {}

    fn on_response(&self, _response: &mut HttpResponse) -> Result<(), ResolveError> {
        Ok(())
    }
}

/// Stamps a fixed header set on every request. Some sites serve a different
/// page to generic clients, so we present ourselves as a crawler.
pub struct HeaderMiddleware {
    headers: HeaderMap,
}

impl HeaderMiddleware {
    pub fn from_config(config: &HttpConfig, referer: Option<&str>) -> Result<Self> {
        let mut pairs: Vec<(HeaderName, &str)> = vec![
            (USER_AGENT, config.user_agent.as_str()),
            (ACCEPT_LANGUAGE, config.accept_language.as_str()),
            (CONNECTION, "Keep-Alive"),
            (CACHE_CONTROL, "max-age=0"),
        ];
        if let Some(referer) = referer {
            pairs.push((REFERER, referer));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}: {:?}", name, value))?;
            headers.insert(name, value);
        }
        Ok(Self { headers })
    }
}

impl Middleware for HeaderMiddleware {
    fn on_request(&self, request: &mut HttpRequest) {
        for (name, value) in &self.headers {
            request.headers.insert(name.clone(), value.clone());
        }
    }
}

/// Asks for gzip and inflates gzip bodies before anything downstream parses
/// them. Inflating past `max_decoded_bytes` is an error.
pub struct GzipMiddleware {
    max_decoded_bytes: usize,
}

impl GzipMiddleware {
    pub fn new(max_decoded_bytes: usize) -> Self {
        Self { max_decoded_bytes }
    }

    pub fn from_config(config: &HttpConfig) -> Self {
        Self::new(config.max_body_bytes)
    }
}

impl Middleware for GzipMiddleware {
    fn on_request(&self, request: &mut HttpRequest) {
        request
            .headers
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }

    fn on_response(&self, response: &mut HttpResponse) -> Result<(), ResolveError> {
        let gzipped = response
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));
        if !gzipped || response.body.is_empty() {
            return Ok(());
        }

        let mut decoded = Vec::new();
        GzDecoder::new(response.body.as_slice())
            .take(self.max_decoded_bytes as u64 + 1)
            .read_to_end(&mut decoded)
            .map_err(|e| {
                ResolveError::Malformed(format!("gzip body from {}: {}", response.url, e))
            })?;
        if decoded.len() > self.max_decoded_bytes {
            return Err(ResolveError::Malformed(format!(
                "gzip body from {} inflates past {} bytes",
                response.url, self.max_decoded_bytes
            )));
        }

        response.body = decoded;
        response.headers.remove(CONTENT_ENCODING);
        response.headers.remove(CONTENT_LENGTH);
        Ok(())
    }
}
