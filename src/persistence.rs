use crate::config::WriteMode;
use crate::pipeline;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::ConnectionManager;
use diesel::upsert::excluded;
use log::error;
use r2d2::Pool;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// One cleaned observation. Doubles as the diesel row model and the
/// serde/CSV record; the two timestamp columns carry the `_utc` suffix to
/// mark that normalization already happened.
#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::cleaned_prices)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedPriceRecord {
    #[diesel(deserialize_as = i64)]
    pub id: Option<i64>,
    pub coin_id: i64,
    pub name: String,
    pub symbol: String,
    pub cmc_rank: Option<i64>,
    pub price: Option<f64>,
    pub volume_24h: Option<f64>,
    pub market_cap: Option<f64>,
    pub percent_change_1h: Option<f64>,
    pub percent_change_24h: Option<f64>,
    pub percent_change_7d: Option<f64>,
    pub last_updated_utc: Option<DateTime<Utc>>,
    pub timestamp_utc: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to persist cleaned rows: {0}")]
    Write(String),
}

#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Persist a cleaned batch. Atomic in both modes: either every row
    /// lands or none do. In append-merge mode the store re-applies the
    /// dedup rule on `(coin_id, timestamp_utc)` against what it already
    /// holds, incoming rows winning.
    async fn write(&self, rows: Vec<CleanedPriceRecord>, mode: WriteMode) -> Result<(), SinkError>;

    async fn listings_since(&self, since: DateTime<Utc>)
        -> anyhow::Result<Vec<CleanedPriceRecord>>;
}

pub struct PgPriceStore {
    pg_pool: Arc<Pool<ConnectionManager<PgConnection>>>,
}

impl PgPriceStore {
    pub fn new(pg_pool: Arc<Pool<ConnectionManager<PgConnection>>>) -> Self {
        Self { pg_pool }
    }
}

#[async_trait]
impl PriceStore for PgPriceStore {
    async fn write(&self, rows: Vec<CleanedPriceRecord>, mode: WriteMode) -> Result<(), SinkError> {
        use crate::schema::cleaned_prices::dsl::*;

        let mut connection = self
            .pg_pool
            .get()
            .map_err(|e| SinkError::Write(e.to_string()))?;

        connection
            .transaction::<_, diesel::result::Error, _>(|conn| {
                match mode {
                    WriteMode::Overwrite => {
                        diesel::delete(cleaned_prices).execute(conn)?;
                        diesel::insert_into(cleaned_prices)
                            .values(&rows)
                            .execute(conn)?;
                    }
                    WriteMode::AppendMerge => {
                        // The batch arrives already deduped by the pipeline,
                        // so each key conflicts at most once per statement.
                        diesel::insert_into(cleaned_prices)
                            .values(&rows)
                            .on_conflict((coin_id, timestamp_utc))
                            .do_update()
                            .set((
                                name.eq(excluded(name)),
                                symbol.eq(excluded(symbol)),
                                cmc_rank.eq(excluded(cmc_rank)),
                                price.eq(excluded(price)),
                                volume_24h.eq(excluded(volume_24h)),
                                market_cap.eq(excluded(market_cap)),
                                percent_change_1h.eq(excluded(percent_change_1h)),
                                percent_change_24h.eq(excluded(percent_change_24h)),
                                percent_change_7d.eq(excluded(percent_change_7d)),
                                last_updated_utc.eq(excluded(last_updated_utc)),
                            ))
                            .execute(conn)?;
                    }
                }
                Ok(())
            })
            .map_err(|e| {
                error!("failed to write cleaned rows: {e}");
                SinkError::Write(e.to_string())
            })?;

        Ok(())
    }

    async fn listings_since(
        &self,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CleanedPriceRecord>> {
        use crate::schema::cleaned_prices::dsl::*;

        let mut connection = self.pg_pool.get()?;

        let fetched = cleaned_prices
            .filter(timestamp_utc.gt(since))
            .order((coin_id.asc(), timestamp_utc.asc()))
            .select(CleanedPriceRecord::as_select())
            .load::<CleanedPriceRecord>(&mut connection)
            .map_err(|e| {
                error!("failed to load cleaned rows: {e}");
                anyhow::anyhow!("failed to load cleaned rows")
            })?;

        Ok(fetched)
    }
}

/// File sink mirroring the cleaned table to a CSV export. Overwrite rewrites
/// the file from the batch; append-merge folds the batch into the existing
/// rows and re-applies the dedup rule before rewriting.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_existing(&self) -> anyhow::Result<Vec<CleanedPriceRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&self.path)?;
        let rows = reader
            .deserialize::<CleanedPriceRecord>()
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn rewrite(&self, rows: &[CleanedPriceRecord]) -> anyhow::Result<()> {
        // Write to a sibling temp file and rename, so a failed write never
        // leaves a truncated export behind.
        let tmp_path = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp_path)?;
            for row in rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}

#[async_trait]
impl PriceStore for CsvSink {
    async fn write(&self, rows: Vec<CleanedPriceRecord>, mode: WriteMode) -> Result<(), SinkError> {
        let merged = match mode {
            WriteMode::Overwrite => rows,
            WriteMode::AppendMerge => {
                let mut existing = self
                    .read_existing()
                    .map_err(|e| SinkError::Write(e.to_string()))?;
                existing.extend(rows);
                pipeline::merge_dedup(existing)
            }
        };

        self.rewrite(&merged).map_err(|e| {
            error!("failed to write csv export: {e}");
            SinkError::Write(e.to_string())
        })
    }

    async fn listings_since(
        &self,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CleanedPriceRecord>> {
        let rows = self
            .read_existing()?
            .into_iter()
            .filter(|row| row.timestamp_utc > since)
            .collect();

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(coin_id: i64, hour: u32, price: f64) -> CleanedPriceRecord {
        CleanedPriceRecord {
            id: None,
            coin_id,
            name: format!("Coin{coin_id}"),
            symbol: format!("C{coin_id}"),
            cmc_rank: Some(coin_id),
            price: Some(price),
            volume_24h: Some(1000.0),
            market_cap: None,
            percent_change_1h: Some(0.1),
            percent_change_24h: None,
            percent_change_7d: Some(-2.5),
            last_updated_utc: Some(Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()),
            timestamp_utc: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
        }
    }

    fn temp_sink(test_name: &str) -> CsvSink {
        let path = std::env::temp_dir().join(format!(
            "crypto-insights-{test_name}-{}.csv",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        CsvSink::new(path)
    }

    #[tokio::test]
    async fn csv_overwrite_replaces_previous_rows() {
        let sink = temp_sink("overwrite");

        sink.write(vec![record(1, 3, 100.0), record(2, 3, 50.0)], WriteMode::Overwrite)
            .await
            .unwrap();
        sink.write(vec![record(3, 4, 7.0)], WriteMode::Overwrite)
            .await
            .unwrap();

        let rows = sink.read_existing().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].coin_id, 3);

        let _ = std::fs::remove_file(&sink.path);
    }

    #[tokio::test]
    async fn csv_append_merge_dedups_on_key() {
        let sink = temp_sink("append-merge");

        sink.write(vec![record(1, 3, 100.0)], WriteMode::AppendMerge)
            .await
            .unwrap();
        // Same (coin_id, timestamp_utc) key, new price: incoming row wins.
        sink.write(
            vec![record(1, 3, 101.0), record(2, 3, 50.0)],
            WriteMode::AppendMerge,
        )
        .await
        .unwrap();

        let rows = sink.read_existing().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].coin_id, 1);
        assert_eq!(rows[0].price, Some(101.0));
        assert_eq!(rows[1].coin_id, 2);

        let _ = std::fs::remove_file(&sink.path);
    }

    #[tokio::test]
    async fn csv_round_trips_missing_values() {
        let sink = temp_sink("missing");

        let mut row = record(1, 3, 100.0);
        row.market_cap = None;
        row.last_updated_utc = None;
        sink.write(vec![row.clone()], WriteMode::Overwrite)
            .await
            .unwrap();

        let rows = sink.read_existing().unwrap();
        assert_eq!(rows, vec![row]);

        let _ = std::fs::remove_file(&sink.path);
    }

    #[tokio::test]
    async fn csv_listings_since_filters_by_poll_time() {
        let sink = temp_sink("since");

        sink.write(
            vec![record(1, 3, 100.0), record(1, 9, 110.0)],
            WriteMode::Overwrite,
        )
        .await
        .unwrap();

        let since = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        let rows = sink.listings_since(since).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, Some(110.0));

        let _ = std::fs::remove_file(&sink.path);
    }
}
