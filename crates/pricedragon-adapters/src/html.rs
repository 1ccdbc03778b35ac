use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use pricedragon_core::{Platform, RawRecord};
use pricedragon_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{expand_listing_url, read_fixture, FetchContext, RecordSource, SourceBatch, SourceConfig, SourceError};

/// CSS selectors for one product card. Every field selector is scoped to the card matched
/// by `item`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub item: String,
    pub name: String,
    pub price: String,
    pub link: String,
    #[serde(default)]
    pub original_price: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub promotional_tag: Option<String>,
    /// Present inside a card when the product cannot be ordered.
    #[serde(default)]
    pub sold_out: Option<String>,
    /// Attribute on the card carrying the platform product id.
    #[serde(default = "default_product_id_attr")]
    pub product_id_attr: String,
}

fn default_product_id_attr() -> String {
    "data-id".to_string()
}

#[derive(Debug)]
struct CompiledSelectors {
    item: Selector,
    name: Selector,
    price: Selector,
    link: Selector,
    original_price: Option<Selector>,
    image: Option<Selector>,
    brand: Option<Selector>,
    description: Option<Selector>,
    promotional_tag: Option<Selector>,
    sold_out: Option<Selector>,
    product_id_attr: String,
}

fn parse_selector(selector: &str) -> Result<Selector, SourceError> {
    Selector::parse(selector).map_err(|e| SourceError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn parse_optional(selector: &Option<String>) -> Result<Option<Selector>, SourceError> {
    selector.as_deref().map(parse_selector).transpose()
}

impl CompiledSelectors {
    fn compile(config: &SelectorConfig) -> Result<Self, SourceError> {
        Ok(Self {
            item: parse_selector(&config.item)?,
            name: parse_selector(&config.name)?,
            price: parse_selector(&config.price)?,
            link: parse_selector(&config.link)?,
            original_price: parse_optional(&config.original_price)?,
            image: parse_optional(&config.image)?,
            brand: parse_optional(&config.brand)?,
            description: parse_optional(&config.description)?,
            promotional_tag: parse_optional(&config.promotional_tag)?,
            sold_out: parse_optional(&config.sold_out)?,
            product_id_attr: config.product_id_attr.clone(),
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(card: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

#[derive(Debug, Clone)]
enum ListingOrigin {
    Fixture(PathBuf),
    Live {
        urls: Vec<String>,
        fetcher: Arc<HttpFetcher>,
    },
}

/// Selector-driven product listing, either replayed from a captured page or fetched live.
#[derive(Debug)]
pub struct HtmlListingSource {
    source_id: String,
    platform: Platform,
    base_url: Option<String>,
    selectors: CompiledSelectors,
    origin: ListingOrigin,
}

impl HtmlListingSource {
    pub fn from_fixture(
        config: &SourceConfig,
        selectors: SelectorConfig,
        path: PathBuf,
    ) -> Result<Self, SourceError> {
        Self::build(config, selectors, ListingOrigin::Fixture(path))
    }

    pub fn live(
        config: &SourceConfig,
        selectors: SelectorConfig,
        fetcher: Arc<HttpFetcher>,
    ) -> Result<Self, SourceError> {
        if config.listing_urls.is_empty() {
            return Err(SourceError::Config {
                source_id: config.source_id.clone(),
                message: "live mode requires listing_urls".to_string(),
            });
        }
        Self::build(
            config,
            selectors,
            ListingOrigin::Live {
                urls: config.listing_urls.clone(),
                fetcher,
            },
        )
    }

    fn build(
        config: &SourceConfig,
        selectors: SelectorConfig,
        origin: ListingOrigin,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            source_id: config.source_id.clone(),
            platform: config.platform,
            base_url: config.base_url.clone(),
            selectors: CompiledSelectors::compile(&selectors)?,
            origin,
        })
    }

    fn absolute_url(&self, href: String) -> String {
        match &self.base_url {
            Some(base) if !href.starts_with("http://") && !href.starts_with("https://") => {
                format!("{}/{}", base.trim_end_matches('/'), href.trim_start_matches('/'))
            }
            _ => href,
        }
    }

    pub fn parse_listing(&self, html: &str) -> Vec<RawRecord> {
        let document = Html::parse_document(html);
        let s = &self.selectors;
        document
            .select(&s.item)
            .map(|card| {
                let sold_out = s
                    .sold_out
                    .as_ref()
                    .map(|sel| card.select(sel).next().is_some())
                    .unwrap_or(false);
                RawRecord {
                    platform: self.platform.as_str().to_string(),
                    product_id: card
                        .value()
                        .attr(&s.product_id_attr)
                        .map(|id| id.trim().to_string())
                        .unwrap_or_default(),
                    name: select_first_text(card, &s.name).unwrap_or_default(),
                    description: s.description.as_ref().and_then(|sel| select_first_text(card, sel)),
                    price: select_first_text(card, &s.price).map(JsonValue::String),
                    original_price: s
                        .original_price
                        .as_ref()
                        .and_then(|sel| select_first_text(card, sel))
                        .map(JsonValue::String),
                    availability: Some(!sold_out),
                    url: select_first_attr(card, &s.link, "href").map(|href| self.absolute_url(href)),
                    image_url: s.image.as_ref().and_then(|sel| {
                        select_first_attr(card, sel, "src").map(|src| self.absolute_url(src))
                    }),
                    brand: s.brand.as_ref().and_then(|sel| select_first_text(card, sel)),
                    stock_status: Some(if sold_out { "out_of_stock" } else { "in_stock" }.to_string()),
                    promotional_tag: s
                        .promotional_tag
                        .as_ref()
                        .and_then(|sel| select_first_text(card, sel)),
                }
            })
            .collect()
    }
}

#[async_trait]
impl RecordSource for HtmlListingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self, ctx: &FetchContext, query: &str) -> Result<SourceBatch, SourceError> {
        let mut batch = SourceBatch::default();
        match &self.origin {
            ListingOrigin::Fixture(path) => {
                debug!(run_id = %ctx.run_id, source_id = %self.source_id, query, "replaying html fixture");
                batch.records = self.parse_listing(&read_fixture(path)?);
            }
            ListingOrigin::Live { urls, fetcher } => {
                let run_id = ctx.run_id.to_string();
                for template in urls {
                    let url = expand_listing_url(template, query);
                    let page = fetcher.fetch_text(&run_id, &self.source_id, &url).await?;
                    let records = self.parse_listing(&page.body);
                    info!(source_id = %self.source_id, url = %page.final_url, cards = records.len(), "parsed listing page");
                    batch.records.extend(records);
                }
            }
        }
        Ok(batch)
    }
}
