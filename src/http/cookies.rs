use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use cookie::Cookie as SetCookie;
use parking_lot::Mutex;
use reqwest::header::{HeaderValue, COOKIE, SET_COOKIE};
use reqwest::Url;
use tracing::{debug, warn};

use super::{HttpRequest, HttpResponse, Middleware};
use crate::error::ResolveError;

const JAR_HEADER: &str = "#LWP-Cookies-2.0";
const LINE_PREFIX: &str = "Set-Cookie3:";

#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    /// Set when the cookie came without a `Domain` attribute and only
    /// applies to the exact host that sent it.
    pub host_only: bool,
}

impl Cookie {
    fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn matches(&self, url: &Url, now: DateTime<Utc>) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };

        domain_ok
            && path_matches(url.path(), &self.path)
            && (!self.secure || url.scheme() == "https")
            && !self.is_expired(now)
    }

    fn to_line(&self) -> String {
        let mut line = format!(
            "{} {}=\"{}\"; path=\"{}\"; domain=\"{}\"",
            LINE_PREFIX, self.name, self.value, self.path, self.domain
        );
        if let Some(expires) = self.expires {
            let _ = write!(line, "; expires=\"{}\"", expires.to_rfc3339());
        }
        if self.secure {
            line.push_str("; secure");
        }
        if self.host_only {
            line.push_str("; host_only");
        }
        line.push_str("; version=0");
        line
    }

    fn from_line(line: &str) -> Result<Self> {
        let rest = line
            .strip_prefix(LINE_PREFIX)
            .with_context(|| format!("Unexpected cookie jar line: {:?}", line))?;
        let mut parts = rest.split(';').map(str::trim);

        let (name, value) = parts
            .next()
            .and_then(|p| p.split_once('='))
            .with_context(|| format!("Cookie line without name=value: {:?}", line))?;

        let mut cookie = Cookie {
            name: name.trim().to_string(),
            value: unquote(value).to_string(),
            domain: String::new(),
            path: "/".to_string(),
            expires: None,
            secure: false,
            host_only: false,
        };

        for part in parts {
            let (key, val) = match part.split_once('=') {
                Some((k, v)) => (k.trim(), unquote(v)),
                None => (part, ""),
            };
            match key {
                "path" => cookie.path = val.to_string(),
                "domain" => cookie.domain = val.to_string(),
                "expires" => {
                    let at = DateTime::parse_from_rfc3339(val)
                        .with_context(|| format!("Bad expiry in cookie jar: {:?}", val))?;
                    cookie.expires = Some(at.with_timezone(&Utc));
                }
                "secure" => cookie.secure = true,
                "host_only" => cookie.host_only = true,
                _ => {}
            }
        }

        if cookie.name.is_empty() || cookie.domain.is_empty() {
            bail!("Cookie line missing name or domain: {:?}", line);
        }
        Ok(cookie)
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Parse one `Set-Cookie` header sent in reply to `url`. Returns `None` for
/// garbage or for a `Domain` the host is not allowed to set.
fn parse_set_cookie(raw: &str, url: &Url, now: DateTime<Utc>) -> Option<Cookie> {
    let host = url.host_str()?.to_ascii_lowercase();
    let parsed = match SetCookie::parse(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Ignoring Set-Cookie from {}: {}", host, e);
            return None;
        }
    };

    let mut cookie = Cookie {
        name: parsed.name().to_string(),
        value: parsed.value_trimmed().to_string(),
        domain: host.clone(),
        path: default_path(url),
        expires: None,
        secure: parsed.secure().unwrap_or(false),
        host_only: true,
    };

    if let Some(domain) = parsed.domain().map(str::to_ascii_lowercase) {
        if !domain.is_empty() {
            if !domain_matches(&host, &domain) {
                debug!("Rejecting cookie {} for {}: domain {}", cookie.name, host, domain);
                return None;
            }
            cookie.domain = domain;
            cookie.host_only = false;
        }
    }
    if let Some(path) = parsed.path().filter(|p| p.starts_with('/')) {
        cookie.path = path.to_string();
    }

    // Max-Age wins over Expires. A lifetime past chrono's range means no expiry.
    if let Some(max_age) = parsed.max_age() {
        let seconds = max_age.whole_seconds();
        cookie.expires = if seconds <= 0 {
            Some(now - Duration::seconds(1))
        } else {
            Duration::try_seconds(seconds).and_then(|ttl| now.checked_add_signed(ttl))
        };
    } else if let Some(at) = parsed.expires_datetime() {
        cookie.expires = DateTime::from_timestamp(at.unix_timestamp(), 0);
    }

    Some(cookie)
}

/// Cookie store persisted to a text file.
///
/// Every cookie is written out, session cookies and ones that have since
/// expired included. Expired cookies are simply not sent; a cookie that
/// arrives already expired deletes its slot.
///
/// Each change snapshots the jar under the cookie lock and stamps it with a
/// generation number. Inside a tokio runtime the file write runs on the
/// blocking pool; the writer lock plus the generation check keep an older
/// snapshot from overwriting a newer one.
pub struct CookieJar {
    path: Option<PathBuf>,
    cookies: Mutex<Vec<Cookie>>,
    generation: AtomicU64,
    written: Arc<Mutex<u64>>,
}

impl CookieJar {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cookies: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            written: Arc::new(Mutex::new(0)),
        }
    }

    /// Open the jar at `path`. A missing or unreadable file gives an empty jar.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cookies = match std::fs::read_to_string(&path) {
            Ok(content) => match parse_jar(&content) {
                Ok(cookies) => {
                    debug!("Loaded {} cookies from {}", cookies.len(), path.display());
                    cookies
                }
                Err(e) => {
                    warn!(
                        "Ignoring corrupt cookie jar {}: {:#}",
                        path.display(),
                        e
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cookie jar at {}, starting empty", path.display());
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to read cookie jar {}: {}", path.display(), e);
                Vec::new()
            }
        };

        Self {
            path: Some(path),
            cookies: Mutex::new(cookies),
            generation: AtomicU64::new(0),
            written: Arc::new(Mutex::new(0)),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[cfg(test)]
    pub fn cookies(&self) -> Vec<Cookie> {
        self.cookies.lock().clone()
    }

    /// Value for the `Cookie` request header, if anything applies to `url`.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let now = Utc::now();
        let cookies = self.cookies.lock();
        let mut matching: Vec<&Cookie> = cookies.iter().filter(|c| c.matches(url, now)).collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Record `Set-Cookie` values received from `url` and rewrite the jar
    /// file if anything changed.
    pub fn store<'a>(&self, url: &Url, set_cookies: impl IntoIterator<Item = &'a str>) {
        let now = Utc::now();
        let mut cookies = self.cookies.lock();
        let mut changed = false;

        for raw in set_cookies {
            let Some(cookie) = parse_set_cookie(raw, url, now) else {
                continue;
            };
            changed = true;
            let expired = cookie.is_expired(now);
            cookies.retain(|existing| !existing.same_slot(&cookie));
            if expired {
                debug!("Cookie {} for {} removed", cookie.name, cookie.domain);
            } else {
                cookies.push(cookie);
            }
        }

        if changed {
            self.persist(&cookies);
        }
    }

    // Called with the cookie lock held so generations follow change order.
    fn persist(&self, cookies: &[Cookie]) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let content = render_jar(cookies);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let written = self.written.clone();

        let job = move || {
            let mut last = written.lock();
            if *last > generation {
                return;
            }
            match write_jar(&path, &content) {
                Ok(()) => *last = generation,
                Err(e) => warn!("Failed to save cookie jar: {:#}", e),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }
}

fn render_jar(cookies: &[Cookie]) -> String {
    let mut content = String::from(JAR_HEADER);
    content.push('\n');
    for cookie in cookies {
        content.push_str(&cookie.to_line());
        content.push('\n');
    }
    content
}

fn write_jar(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn parse_jar(content: &str) -> Result<Vec<Cookie>> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        None => return Ok(Vec::new()),
        Some(first) if first == JAR_HEADER => {}
        Some(first) => bail!("Missing {} header, found {:?}", JAR_HEADER, first),
    }

    lines
        .filter(|l| !l.starts_with('#'))
        .map(Cookie::from_line)
        .collect()
}

/// Sends stored cookies with every request and records the ones that come
/// back.
pub struct CookieMiddleware {
    jar: Arc<CookieJar>,
}

impl CookieMiddleware {
    pub fn new(jar: Arc<CookieJar>) -> Self {
        Self { jar }
    }
}

impl Middleware for CookieMiddleware {
    fn on_request(&self, request: &mut HttpRequest) {
        let header = self
            .jar
            .header_for(&request.url)
            .and_then(|value| HeaderValue::from_str(&value).ok());
        match header {
            Some(value) => {
                request.headers.insert(COOKIE, value);
            }
            None => {
                request.headers.remove(COOKIE);
            }
        }
    }

    fn on_response(&self, response: &mut HttpResponse) -> Result<(), ResolveError> {
        let values = response
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok());
        self.jar.store(&response.url, values);
        Ok(())
    }
}
