pub mod cookies;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, COOKIE, LOCATION};
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::ResolveError;

pub use cookies::{CookieJar, CookieMiddleware};
pub use middleware::{GzipMiddleware, HeaderMiddleware, Middleware};

/// Outgoing request as seen by the middleware chain.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub form: Option<Vec<(String, String)>>,
    /// When false the final body is never downloaded; only status and URL
    /// come back.
    pub read_body: bool,
}

impl HttpRequest {
    pub fn get(url: &str) -> Result<Self, ResolveError> {
        Ok(Self {
            method: Method::GET,
            url: parse_url(url)?,
            headers: HeaderMap::new(),
            form: None,
            read_body: true,
        })
    }

    pub fn post_form(url: &str, form: &[(&str, &str)]) -> Result<Self, ResolveError> {
        Ok(Self {
            method: Method::POST,
            url: parse_url(url)?,
            headers: HeaderMap::new(),
            form: Some(
                form.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            read_body: true,
        })
    }

    /// Stop at the final status and URL without downloading the body.
    pub fn head_only(mut self) -> Self {
        self.read_body = false;
        self
    }

    /// The request to send after a redirect to `target`.
    fn follow(mut self, target: Url, status: StatusCode) -> Self {
        let see_other = matches!(
            status,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
        );
        if see_other && self.method == Method::POST {
            self.method = Method::GET;
            self.form = None;
        }
        self.url = target;
        self.headers.remove(COOKIE);
        self
    }
}

fn parse_url(url: &str) -> Result<Url, ResolveError> {
    Url::parse(url).map_err(|e| ResolveError::InvalidUrl(format!("{}: {}", url, e)))
}

/// Response after the middleware chain ran; the body is already decoded.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// URL of the request that produced this response.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn redirect_target(&self) -> Result<Option<Url>, ResolveError> {
        if !self.status.is_redirection() {
            return Ok(None);
        }
        let Some(location) = self.headers.get(LOCATION) else {
            return Ok(None);
        };
        let location = location
            .to_str()
            .map_err(|_| ResolveError::Malformed(format!("non-ASCII Location from {}", self.url)))?;
        self.url
            .join(location)
            .map(Some)
            .map_err(|e| ResolveError::Malformed(format!("bad Location {:?}: {}", location, e)))
    }
}

/// A single reqwest client wrapped in an ordered middleware chain. Redirects
/// are followed here rather than inside reqwest so every hop passes through
/// the chain (cookies set mid-redirect are kept).
pub struct HttpClient {
    client: reqwest::Client,
    middleware: Vec<Arc<dyn Middleware>>,
    max_redirects: usize,
    max_body_bytes: usize,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            middleware: Vec::new(),
            max_redirects: config.max_redirects,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Append a middleware; requests and responses visit them in insertion order.
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub async fn fetch(&self, mut request: HttpRequest) -> Result<HttpResponse, ResolveError> {
        let origin = request.url.to_string();

        for hop in 0..=self.max_redirects {
            for m in &self.middleware {
                m.on_request(&mut request);
            }

            debug!("{} {} (hop {})", request.method, request.url, hop);

            let mut builder = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone());
            if let Some(form) = &request.form {
                builder = builder.form(form);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| ResolveError::from_reqwest(request.url.as_str(), e))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = if request.read_body && !status.is_redirection() {
                self.read_limited(response, &request.url).await?
            } else {
                Vec::new()
            };

            let mut response = HttpResponse {
                url: request.url.clone(),
                status,
                headers,
                body,
            };
            for m in &self.middleware {
                m.on_response(&mut response)?;
            }

            if let Some(target) = response.redirect_target()? {
                debug!("{} redirected to {}", response.url, target);
                request = request.follow(target, status);
                continue;
            }

            if !status.is_success() {
                return Err(ResolveError::Status {
                    status: status.as_u16(),
                    url: response.url.to_string(),
                });
            }

            return Ok(response);
        }

        Err(ResolveError::TooManyRedirects {
            url: origin,
            hops: self.max_redirects,
        })
    }

    async fn read_limited(
        &self,
        mut response: reqwest::Response,
        url: &Url,
    ) -> Result<Vec<u8>, ResolveError> {
        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(self.too_large(url));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ResolveError::from_reqwest(url.as_str(), e))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(self.too_large(url));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn too_large(&self, url: &Url) -> ResolveError {
        ResolveError::Malformed(format!(
            "body from {} exceeds {} bytes",
            url, self.max_body_bytes
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorKind};

    fn test_config() -> HttpConfig {
        HttpConfig {
            timeout_secs: 5,
            max_redirects: 3,
            ..HttpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_follows_redirect_chain_to_final_url() {
        let mut server = mockito::Server::new_async().await;
        let _first = server
            .mock("GET", "/short")
            .with_status(301)
            .with_header("location", "/middle")
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/middle")
            .with_status(302)
            .with_header("location", &format!("{}/final", server.url()))
            .create_async()
            .await;
        let last = server
            .mock("GET", "/final")
            .with_status(200)
            .with_body("done")
            .create_async()
            .await;

        let client = HttpClient::new(&test_config()).unwrap();
        let request = HttpRequest::get(&format!("{}/short", server.url())).unwrap();
        let response = client.fetch(request).await.unwrap();

        assert_eq!(response.url.as_str(), format!("{}/final", server.url()));
        assert_eq!(response.text(), "done");
        last.assert_async().await;
    }

    #[tokio::test]
    async fn test_redirect_loop_exhausts() {
        let mut server = mockito::Server::new_async().await;
        let _loop = server
            .mock("GET", "/loop")
            .with_status(302)
            .with_header("location", "/loop")
            .expect(4)
            .create_async()
            .await;

        let client = HttpClient::new(&test_config()).unwrap();
        let request = HttpRequest::get(&format!("{}/loop", server.url())).unwrap();
        let err = client.fetch(request).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RedirectLimit);
    }

    #[tokio::test]
    async fn test_error_status_is_classified() {
        let mut server = mockito::Server::new_async().await;
        let _gone = server
            .mock("GET", "/gone")
            .with_status(404)
            .create_async()
            .await;
        let _down = server
            .mock("GET", "/down")
            .with_status(503)
            .create_async()
            .await;

        let client = HttpClient::new(&test_config()).unwrap();
        let gone = client
            .fetch(HttpRequest::get(&format!("{}/gone", server.url())).unwrap())
            .await
            .unwrap_err();
        let down = client
            .fetch(HttpRequest::get(&format!("{}/down", server.url())).unwrap())
            .await
            .unwrap_err();

        assert_eq!(gone.kind(), ErrorKind::ClientError);
        assert_eq!(down.kind(), ErrorKind::ServerError);
    }

    #[tokio::test]
    async fn test_post_redirect_becomes_get() {
        let mut server = mockito::Server::new_async().await;
        let _post = server
            .mock("POST", "/submit")
            .match_body("a=1")
            .with_status(302)
            .with_header("location", "/result")
            .create_async()
            .await;
        let result = server
            .mock("GET", "/result")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let client = HttpClient::new(&test_config()).unwrap();
        let request =
            HttpRequest::post_form(&format!("{}/submit", server.url()), &[("a", "1")]).unwrap();
        let response = client.fetch(request).await.unwrap();

        assert_eq!(response.text(), "ok");
        result.assert_async().await;
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _big = server
            .mock("GET", "/big")
            .with_status(200)
            .with_body(vec![b'x'; 4096])
            .create_async()
            .await;

        let client = HttpClient::new(&HttpConfig {
            max_body_bytes: 1024,
            ..test_config()
        })
        .unwrap();
        let err = client
            .fetch(HttpRequest::get(&format!("{}/big", server.url())).unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_head_only_skips_body() {
        let mut server = mockito::Server::new_async().await;
        let _short = server
            .mock("GET", "/s")
            .with_status(302)
            .with_header("location", "/file.iso")
            .create_async()
            .await;
        let _file = server
            .mock("GET", "/file.iso")
            .with_status(200)
            .with_body(vec![0u8; 64 * 1024])
            .create_async()
            .await;

        let client = HttpClient::new(&HttpConfig {
            max_body_bytes: 1024,
            ..test_config()
        })
        .unwrap();
        let request = HttpRequest::get(&format!("{}/s", server.url()))
            .unwrap()
            .head_only();
        let response = client.fetch(request).await.unwrap();

        assert_eq!(response.url.as_str(), format!("{}/file.iso", server.url()));
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_server_times_out_and_is_retried() {
        use crate::pipeline::{with_retry, RetryPolicy};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let client = HttpClient::new(&HttpConfig {
            timeout_secs: 1,
            ..test_config()
        })
        .unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let url = format!("http://{}/slow", addr);

        let err = with_retry(&policy, || async {
            client.fetch(HttpRequest::get(&url)?).await
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_url_is_malformed() {
        let err = HttpRequest::get("not a url").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }
}
