use crate::config::Config;
use crate::data::CycleSummary;
use crate::persistence::{CsvSink, PriceStore};
use crate::pipeline::{self, CleaningConfig, SourceTimezone};
use crate::scraper::Scraper;
use crate::web::run_web_server;
use log::{debug, error, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct App<S: Scraper, P: PriceStore> {
    config: Config,
    scraper: S,
    store: Arc<P>,
    csv_sink: Option<CsvSink>,
}

impl<S: Scraper, P: PriceStore + 'static> App<S, P> {
    pub fn new(config: Config, scraper: S, store: Arc<P>) -> Self {
        let csv_sink = config.csv_export_path.as_ref().map(CsvSink::new);
        Self {
            config,
            scraper,
            store,
            csv_sink,
        }
    }

    pub async fn run(&mut self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        let source_timezone: SourceTimezone = self.config.source_timezone.parse()?;
        let cleaning_config = CleaningConfig {
            source_timezone,
            leading_row_drop_threshold: self.config.leading_row_drop_threshold,
            leading_row_drop_count: self.config.leading_row_drop_count,
            drop_polled_before: self.config.drop_polled_before,
        };

        let poll_duration =
            std::time::Duration::from_secs(self.config.poll_interval_sec as u64);
        let mut poll_interval = tokio::time::interval(poll_duration);
        let (summary_sender, _summary_receiver) =
            tokio::sync::broadcast::channel::<CycleSummary>(100);

        let server_fut = run_web_server(
            cancellation_token.clone(),
            summary_sender.clone(),
            self.store.clone(),
            self.config.host.clone(),
            self.config.port,
        );

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Cancellation requested, exiting...");
                    break;
                }
                _ = poll_interval.tick() => {
                    let cycle_at = chrono::Utc::now();

                    let raw_rows = match self.scraper.fetch_listings().await {
                        Ok(rows) => rows,
                        Err(e) => {
                            error!("Error fetching listings, skipping cycle: {e}");
                            continue;
                        }
                    };

                    let (cleaned, report) = pipeline::clean(raw_rows, &cleaning_config);
                    info!(
                        "Cycle cleaned: {} in, {} out, {} dropped for missing fields, {} duplicates, {} fields coerced",
                        report.rows_in,
                        report.rows_out,
                        report.rows_dropped_missing_fields,
                        report.duplicates_removed,
                        report.fields_coerced
                    );

                    if cleaned.is_empty() {
                        debug!("No cleaned rows this cycle, nothing to write");
                        continue;
                    }

                    if let Err(e) = self.store.write(cleaned.clone(), self.config.write_mode).await {
                        error!("Error writing cleaned rows: {e}");
                    }

                    if let Some(csv_sink) = &self.csv_sink {
                        if let Err(e) = csv_sink.write(cleaned, self.config.write_mode).await {
                            error!("Error exporting cleaned rows to CSV: {e}");
                        }
                    }

                    let summary = CycleSummary {
                        cycle_at: cycle_at.timestamp() as u64,
                        rows_in: report.rows_in,
                        rows_out: report.rows_out,
                        leading_rows_dropped: report.leading_rows_dropped,
                        rows_dropped_missing_fields: report.rows_dropped_missing_fields,
                        rows_dropped_by_cutoff: report.rows_dropped_by_cutoff,
                        fields_coerced: report.fields_coerced,
                        duplicates_removed: report.duplicates_removed,
                    };
                    if let Err(e) = summary_sender.send(summary) {
                        debug!("No cycle summary subscribers: {e}");
                    }
                },
            }
        }

        server_fut.await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteMode;
    use crate::persistence::{CleanedPriceRecord, SinkError};
    use crate::scraper::{RawPriceRecord, SourceError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct MockScraper {
        rows: Vec<RawPriceRecord>,
        fail: bool,
    }

    #[async_trait]
    impl Scraper for MockScraper {
        async fn fetch_listings(&self) -> Result<Vec<RawPriceRecord>, SourceError> {
            if self.fail {
                Err(SourceError::Unavailable("mock outage".to_string()))
            } else {
                Ok(self.rows.clone())
            }
        }
    }

    struct MockStore {
        writes: Arc<Mutex<Vec<(Vec<CleanedPriceRecord>, WriteMode)>>>,
        fail: bool,
    }

    #[async_trait]
    impl PriceStore for MockStore {
        async fn write(
            &self,
            rows: Vec<CleanedPriceRecord>,
            mode: WriteMode,
        ) -> Result<(), SinkError> {
            if self.fail {
                Err(SinkError::Write("mock failure".to_string()))
            } else {
                self.writes.lock().await.push((rows, mode));
                Ok(())
            }
        }

        async fn listings_since(
            &self,
            since: DateTime<Utc>,
        ) -> anyhow::Result<Vec<CleanedPriceRecord>> {
            Ok(self
                .writes
                .lock()
                .await
                .iter()
                .flat_map(|(rows, _)| rows.clone())
                .filter(|row| row.timestamp_utc > since)
                .collect())
        }
    }

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            poll_interval_sec: 1,
            cmc_api_url: "".to_string(),
            cmc_api_key: "".to_string(),
            listing_limit: 10,
            database_url: "".to_string(),
            source_timezone: "+07:00".to_string(),
            leading_row_drop_threshold: 1100,
            leading_row_drop_count: 1101,
            drop_polled_before: None,
            write_mode: WriteMode::AppendMerge,
            csv_export_path: None,
        }
    }

    fn raw_row(coin_id: i64, price: f64) -> RawPriceRecord {
        RawPriceRecord {
            coin_id: Some(coin_id),
            name: Some(format!("Coin{coin_id}")),
            symbol: Some(format!("C{coin_id}")),
            price: Some(json!(price)),
            polled_at: Some("2024-01-01 10:00:00".to_string()),
            ..RawPriceRecord::default()
        }
    }

    #[tokio::test]
    async fn test_run_cleans_and_writes_batch() {
        // Two rows share a dedup key; the store must only ever see one.
        let scraper = MockScraper {
            rows: vec![raw_row(1, 100.0), raw_row(1, 101.0), raw_row(2, 50.0)],
            fail: false,
        };
        let writes = Arc::new(Mutex::new(vec![]));
        let store = Arc::new(MockStore {
            writes: writes.clone(),
            fail: false,
        });
        let mut app = App::new(test_config(), scraper, store);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            cancel.cancel();
        });

        let _ = app.run(token).await;

        let writes = writes.lock().await;
        assert!(!writes.is_empty());
        let (rows, mode) = &writes[0];
        assert_eq!(*mode, WriteMode::AppendMerge);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].coin_id, 1);
        assert_eq!(rows[0].price, Some(101.0));
        assert_eq!(rows[1].coin_id, 2);
    }

    #[tokio::test]
    async fn test_run_skips_cycle_when_source_unavailable() {
        let scraper = MockScraper {
            rows: vec![],
            fail: true,
        };
        let writes = Arc::new(Mutex::new(vec![]));
        let store = Arc::new(MockStore {
            writes: writes.clone(),
            fail: false,
        });
        let mut app = App::new(test_config(), scraper, store);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            cancel.cancel();
        });

        let _ = app.run(token).await;

        assert!(writes.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_survives_sink_failure() {
        let scraper = MockScraper {
            rows: vec![raw_row(1, 100.0)],
            fail: false,
        };
        let writes = Arc::new(Mutex::new(vec![]));
        let store = Arc::new(MockStore {
            writes: writes.clone(),
            fail: true,
        });
        let mut app = App::new(test_config(), scraper, store);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            cancel.cancel();
        });

        // Write errors are logged, never bubbled out of the loop.
        assert!(app.run(token).await.is_ok());
        assert!(writes.lock().await.is_empty());
    }
}
