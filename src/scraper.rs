use async_trait::async_trait;
use log::{debug, error};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

/// One polled observation as it comes off the listings API, before cleaning.
/// Numeric fields stay as raw JSON values (number or string); coercion is
/// the pipeline's job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawPriceRecord {
    pub coin_id: Option<i64>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub slug: Option<String>,
    pub cmc_rank: Option<i64>,
    pub price: Option<Value>,
    pub volume_24h: Option<Value>,
    pub market_cap: Option<Value>,
    pub percent_change_1h: Option<Value>,
    pub percent_change_24h: Option<Value>,
    pub percent_change_7d: Option<Value>,
    pub last_updated: Option<String>,
    pub polled_at: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("market data source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Scraper {
    async fn fetch_listings(&self) -> Result<Vec<RawPriceRecord>, SourceError>;
}

pub struct CmcScraper {
    client: Client,
    base_api_url: String,
    api_key: String,
    listing_limit: u32,
}

impl CmcScraper {
    pub fn new(base_url: String, api_key: String, listing_limit: u32) -> Self {
        Self {
            client: Client::new(),
            base_api_url: base_url,
            api_key,
            listing_limit,
        }
    }
}

#[async_trait]
impl Scraper for CmcScraper {
    async fn fetch_listings(&self) -> Result<Vec<RawPriceRecord>, SourceError> {
        let base_url = &self.base_api_url;
        let url = format!("{base_url}/v1/cryptocurrency/listings/latest");
        let response = self
            .client
            .get(&url)
            .header("X-CMC_PRO_API_KEY", self.api_key.clone())
            .query(&[
                ("start", "1".to_string()),
                ("limit", self.listing_limit.to_string()),
                ("convert", "USD".to_string()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        if let Some(error_code) = response.pointer("/status/error_code").and_then(Value::as_i64) {
            if error_code != 0 {
                let message = response
                    .pointer("/status/error_message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                error!("listings API returned error {error_code}: {message}");
                return Err(SourceError::Unavailable(message.to_string()));
            }
        }

        let Some(listings) = response.get("data").and_then(Value::as_array) else {
            error!("listings response had no data array: {response}");
            return Err(SourceError::Unavailable(
                "listings response had no data array".to_string(),
            ));
        };

        // One wall-clock stamp for the whole batch, recorded in the host's
        // local time; the pipeline converts it to UTC later.
        let polled_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        let records: Vec<RawPriceRecord> = listings
            .iter()
            .filter_map(|item| {
                if item.is_object() {
                    Some(flatten_listing(item, &polled_at))
                } else {
                    debug!("skipping non-object listing entry: {item}");
                    None
                }
            })
            .collect();

        Ok(records)
    }
}

/// Flatten one listing entry, pulling the USD quote fields up to the top
/// level alongside the coin identity fields.
fn flatten_listing(item: &Value, polled_at: &str) -> RawPriceRecord {
    let usd = item.pointer("/quote/USD");
    let quote_field = |name: &str| usd.and_then(|q| q.get(name)).cloned();
    let str_field = |name: &str| {
        item.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    RawPriceRecord {
        coin_id: item.get("id").and_then(Value::as_i64),
        name: str_field("name"),
        symbol: str_field("symbol"),
        slug: str_field("slug"),
        cmc_rank: item.get("cmc_rank").and_then(Value::as_i64),
        price: quote_field("price"),
        volume_24h: quote_field("volume_24h"),
        market_cap: quote_field("market_cap"),
        percent_change_1h: quote_field("percent_change_1h"),
        percent_change_24h: quote_field("percent_change_24h"),
        percent_change_7d: quote_field("percent_change_7d"),
        last_updated: str_field("last_updated"),
        polled_at: Some(polled_at.to_string()),
    }
}
