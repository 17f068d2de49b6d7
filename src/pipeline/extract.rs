use std::sync::LazyLock;

use regex::Regex;

/// Shortened URL: optional `www<digits>.` prefix, a dotted host and a
/// `/`-led path of word, `+`, `/` and `?` characters.
static SHORT_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:www\d{0,9}\.)?(?P<host>[\w.+]+\w)(?P<path>/[\w+/?]+)")
        .expect("shortened URL pattern is valid")
});

static ITEM_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)store\.steampowered\.com/app/(?P<id>\d+)/?")
        .expect("store item pattern is valid")
});

/// Substring that must appear in a message before the item id scan runs.
pub const ITEM_MARKER: &str = "store.steampowered.com/app/";

/// Cheap pre-check: does the lowercased haystack mention any marker at all?
pub fn mentions_any<S: AsRef<str>>(haystack: &str, markers: &[S]) -> bool {
    let lowered = haystack.to_lowercase();
    markers.iter().any(|m| lowered.contains(m.as_ref()))
}

/// Yields every shortened URL in `haystack` whose host is in `hosts`.
///
/// Hosts are matched case-insensitively and emitted lowercased; the path is
/// kept as written since shorteners are case-sensitive. No `http://` prefix is
/// added. Duplicates are kept, in first-match order.
pub fn find_shortened_urls<'a, S: AsRef<str>>(
    hosts: &'a [S],
    haystack: &'a str,
) -> impl Iterator<Item = String> + 'a {
    SHORT_URL_RE.captures_iter(haystack).filter_map(move |caps| {
        let host = caps.name("host")?.as_str().to_lowercase();
        if !hosts.iter().any(|h| h.as_ref().eq_ignore_ascii_case(&host)) {
            return None;
        }
        let path = caps.name("path")?.as_str();
        Some(format!("{}{}", host, path))
    })
}

/// Yields the numeric id of every store item link in `haystack`.
pub fn find_item_ids(haystack: &str) -> impl Iterator<Item = String> + '_ {
    ITEM_ID_RE
        .captures_iter(haystack)
        .filter_map(|caps| caps.name("id").map(|m| m.as_str().to_string()))
}
