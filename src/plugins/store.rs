use std::fmt;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::{Plugin, ResolvePipeline, Resolver};
use crate::config::Config;
use crate::error::ResolveError;
use crate::http::{
    CookieJar, CookieMiddleware, GzipMiddleware, HeaderMiddleware, HttpClient, HttpRequest,
};
use crate::pipeline::extract::{find_item_ids, mentions_any, ITEM_MARKER};
use crate::pipeline::{compose, RetryPolicy};
use crate::platform::{ChatSender, DeliveryStatus, IncomingMessage};

const LABEL: &str = "[Steam]";

pub const PRICE_UNSET: &str = "price hasn't been set yet";
pub const RELEASE_UNKNOWN: &str = "unknown release date";

/// Form that gets past the store's age check.
const AGE_CONFIRMATION: [(&str, &str); 4] = [
    ("snr", "1_agecheck_agecheck__age-gate"),
    ("ageDay", "1"),
    ("ageMonth", "January"),
    ("ageYear", "1900"),
];

fn selector(css: &'static str) -> Selector {
    Selector::parse(css).expect("store page selector is valid")
}

static AGE_GATE: LazyLock<Selector> = LazyLock::new(|| selector("#agegate_box"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector("div.apphub_AppName"));
static DLC_BUBBLE: LazyLock<Selector> =
    LazyLock::new(|| selector("div.game_area_dlc_bubble.game_area_bubble"));
static PRICE: LazyLock<Selector> = LazyLock::new(|| selector(".price"));
static DISCOUNT_BLOCK: LazyLock<Selector> =
    LazyLock::new(|| selector("div.discount_block.game_purchase_discount"));
static DISCOUNT_PCT: LazyLock<Selector> = LazyLock::new(|| selector("div.discount_pct"));
static DISCOUNT_ORIGINAL: LazyLock<Selector> =
    LazyLock::new(|| selector("div.discount_original_price"));
static DISCOUNT_FINAL: LazyLock<Selector> = LazyLock::new(|| selector("div.discount_final_price"));
static GLANCE_DETAILS: LazyLock<Selector> = LazyLock::new(|| selector("div.glance_details"));
static DIV: LazyLock<Selector> = LazyLock::new(|| selector("div"));
static RELEASE_DATE: LazyLock<Selector> = LazyLock::new(|| selector(".release_date .date"));

/// What we report about a store item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemInfo {
    pub title: String,
    pub release: String,
    pub price: String,
}

impl fmt::Display for ItemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) {}", self.title, self.release, self.price)
    }
}

fn text_of(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<String>();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).next().and_then(text_of)
}

pub fn has_age_gate(html: &str) -> bool {
    Html::parse_document(html).select(&AGE_GATE).next().is_some()
}

/// Pull the item record out of a store page. Only the title is required;
/// everything else falls back to a marker string.
pub fn parse_item_page(html: &str) -> Result<ItemInfo, ResolveError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut title = first_text(root, &TITLE).ok_or(ResolveError::MissingField("title"))?;
    if root.select(&DLC_BUBBLE).next().is_some() && !title.to_lowercase().contains("dlc") {
        title = format!("{}, DLC", title);
    }

    let mut price = first_text(root, &PRICE).unwrap_or_else(|| PRICE_UNSET.to_string());
    if let Some(block) = root.select(&DISCOUNT_BLOCK).next() {
        let pct = first_text(block, &DISCOUNT_PCT);
        let original = first_text(block, &DISCOUNT_ORIGINAL);
        let discounted = first_text(block, &DISCOUNT_FINAL);
        if let (Some(pct), Some(original), Some(discounted)) = (pct, original, discounted) {
            price = format!(
                "{} - {} = {}",
                original,
                pct.trim_start_matches('-'),
                discounted
            );
        }
    }

    let release = root
        .select(&GLANCE_DETAILS)
        .last()
        .and_then(|details| details.select(&DIV).last())
        .and_then(text_of)
        .map(|text| text.replace("Release Date: ", ""))
        .or_else(|| first_text(root, &RELEASE_DATE))
        .unwrap_or_else(|| RELEASE_UNKNOWN.to_string());

    Ok(ItemInfo {
        title,
        release,
        price,
    })
}

/// Fetches and parses a store item page, passing the age check when asked.
pub struct StoreItemResolver {
    http: HttpClient,
    base_url: String,
    country: String,
}

impl StoreItemResolver {
    pub fn new(http: HttpClient, base_url: &str, country: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            country: country.to_string(),
        }
    }
}

#[async_trait]
impl Resolver for StoreItemResolver {
    type Output = ItemInfo;

    async fn resolve(&self, item_id: &str) -> Result<ItemInfo, ResolveError> {
        let page_url = format!("{}/app/{}/?cc={}", self.base_url, item_id, self.country);
        let mut page = self.http.fetch(HttpRequest::get(&page_url)?).await?.text();

        if has_age_gate(&page) {
            debug!("Item {} is behind the age check", item_id);
            let gate_url = format!("{}/agecheck/app/{}/", self.base_url, item_id);
            let request = HttpRequest::post_form(&gate_url, &AGE_CONFIRMATION)?;
            page = self.http.fetch(request).await?.text();
        }

        parse_item_page(&page)
    }
}

/// Replies with title, release date and price for store item links.
pub struct StoreItemLookup {
    pipeline: ResolvePipeline<ItemInfo>,
}

impl StoreItemLookup {
    pub fn new(resolver: Arc<dyn Resolver<Output = ItemInfo>>, retry: RetryPolicy) -> Self {
        Self {
            pipeline: ResolvePipeline::new(resolver, retry),
        }
    }

    pub fn from_config(config: &Config, retry: RetryPolicy) -> Result<Self> {
        let store = &config.plugins.store;
        let referer = format!("{}/", store.base_url.trim_end_matches('/'));
        let jar = Arc::new(CookieJar::load(config.cookie_jar_path("steam")));
        let http = HttpClient::new(&config.http)?
            .with(GzipMiddleware::from_config(&config.http))
            .with(HeaderMiddleware::from_config(&config.http, Some(&referer))?)
            .with(CookieMiddleware::new(jar));

        Ok(Self::new(
            Arc::new(StoreItemResolver::new(http, &store.base_url, &store.country)),
            retry,
        ))
    }
}

#[async_trait]
impl Plugin for StoreItemLookup {
    fn name(&self) -> &'static str {
        "store-item-lookup"
    }

    async fn on_message_status(
        &self,
        message: &IncomingMessage,
        status: DeliveryStatus,
        chat: &dyn ChatSender,
    ) -> Result<()> {
        if status != DeliveryStatus::Received || !mentions_any(&message.body, &[ITEM_MARKER]) {
            return Ok(());
        }

        let ids: Vec<String> = find_item_ids(&message.body).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let lines = self.pipeline.resolve_all(ids, message).await;
        if let Some(reply) = compose(LABEL, &lines) {
            chat.send(&message.conversation, &reply)
                .await
                .context("Failed to send store item reply")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::plugins::testing::*;

    const GAME_PAGE: &str = r#"
        <html><body>
          <div class="apphub_AppName">Papers, Please</div>
          <div class="glance_details">
            <div>Genre: Indie</div>
            <div>Release Date: 8 Aug 2013</div>
          </div>
          <div class="game_purchase_action">
            <div class="game_purchase_price price" itemprop="price">
              249 p.
            </div>
          </div>
        </body></html>
    "#;

    const DISCOUNTED_DLC_PAGE: &str = r#"
        <html><body>
          <div class="apphub_AppName">PAYDAY 2: Gage Weapon Pack</div>
          <div class="game_area_dlc_bubble game_area_bubble">Requires the base game</div>
          <div class="game_purchase_action_bg">
            <div class="discount_block game_purchase_discount">
              <div class="discount_pct">-50%</div>
              <div class="discount_prices">
                <div class="discount_original_price">499 p.</div>
                <div class="discount_final_price" itemprop="price">249 p.</div>
              </div>
            </div>
          </div>
        </body></html>
    "#;

    const AGE_GATE_PAGE: &str = r#"
        <html><body><div id="agegate_box">Please enter your birth date</div></body></html>
    "#;

    #[test]
    fn test_full_page() {
        let info = parse_item_page(GAME_PAGE).unwrap();
        assert_eq!(
            info,
            ItemInfo {
                title: "Papers, Please".to_string(),
                release: "8 Aug 2013".to_string(),
                price: "249 p.".to_string(),
            }
        );
        assert_eq!(info.to_string(), "Papers, Please (8 Aug 2013) 249 p.");
    }

    #[test]
    fn test_discount_overrides_price_and_dlc_suffix() {
        let info = parse_item_page(DISCOUNTED_DLC_PAGE).unwrap();
        assert_eq!(info.title, "PAYDAY 2: Gage Weapon Pack, DLC");
        assert_eq!(info.price, "499 p. - 50% = 249 p.");
        assert_eq!(info.release, RELEASE_UNKNOWN);
    }

    #[test]
    fn test_dlc_suffix_not_doubled() {
        let html = r#"<div class="apphub_AppName">Soundtrack DLC</div>
            <div class="game_area_dlc_bubble game_area_bubble"></div>"#;
        assert_eq!(parse_item_page(html).unwrap().title, "Soundtrack DLC");
    }

    #[test]
    fn test_missing_fields_use_markers() {
        let info = parse_item_page(r#"<div class="apphub_AppName">Coming Soon</div>"#).unwrap();
        assert_eq!(info.price, PRICE_UNSET);
        assert_eq!(info.release, RELEASE_UNKNOWN);
    }

    #[test]
    fn test_release_date_block_fallback() {
        let html = r#"<div class="apphub_AppName">Game</div>
            <div class="release_date"><div class="subtitle">Release Date:</div>
            <div class="date">13 Aug 2013</div></div>"#;
        assert_eq!(parse_item_page(html).unwrap().release, "13 Aug 2013");
    }

    #[test]
    fn test_missing_title_is_no_info() {
        let err = parse_item_page("<html><body><p>Oops</p></body></html>").unwrap_err();
        assert!(matches!(err, ResolveError::MissingField("title")));
    }

    #[test]
    fn test_age_gate_detection() {
        assert!(has_age_gate(AGE_GATE_PAGE));
        assert!(!has_age_gate(GAME_PAGE));
    }

    #[tokio::test]
    async fn test_resolver_passes_age_gate() {
        let mut server = mockito::Server::new_async().await;
        let page = server
            .mock("GET", "/app/218620/")
            .match_query(mockito::Matcher::UrlEncoded("cc".into(), "ru".into()))
            .with_status(200)
            .with_body(AGE_GATE_PAGE)
            .create_async()
            .await;
        let gate = server
            .mock("POST", "/agecheck/app/218620/")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("ageYear".into(), "1900".into()),
                mockito::Matcher::UrlEncoded("ageMonth".into(), "January".into()),
            ]))
            .with_status(200)
            .with_body(DISCOUNTED_DLC_PAGE)
            .create_async()
            .await;

        let resolver = StoreItemResolver::new(
            HttpClient::new(&HttpConfig::default()).unwrap(),
            &server.url(),
            "ru",
        );
        let info = resolver.resolve("218620").await.unwrap();

        assert_eq!(info.price, "499 p. - 50% = 249 p.");
        page.assert_async().await;
        gate.assert_async().await;
    }

    #[tokio::test]
    async fn test_plugin_reports_each_item() {
        let resolver = Arc::new(FakeResolver::new(vec![
            (
                "239030",
                Ok(ItemInfo {
                    title: "Papers, Please".to_string(),
                    release: "8 Aug 2013".to_string(),
                    price: "249 p.".to_string(),
                }),
            ),
            (
                "1",
                Err((|| ResolveError::MissingField("title")) as fn() -> ResolveError),
            ),
        ]));
        let chat = RecordingChat::default();
        let plugin = StoreItemLookup::new(resolver, no_wait_retry());

        plugin
            .on_message_status(
                &message(
                    "http://store.steampowered.com/app/239030/ store.steampowered.com/app/1",
                ),
                DeliveryStatus::Received,
                &chat,
            )
            .await
            .unwrap();

        assert_eq!(
            chat.replies().await,
            vec![
                "[Steam]\n239030 -> Papers, Please (8 Aug 2013) 249 p.\n1 -> unable to retrieve info"
            ]
        );
    }
}
