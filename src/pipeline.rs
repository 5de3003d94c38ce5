use crate::persistence::CleanedPriceRecord;
use crate::scraper::RawPriceRecord;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, warn};
use serde_json::Value;
use std::str::FromStr;

/// Timezone the raw poll timestamps were recorded in. Accepts an IANA zone
/// name ("Asia/Jakarta") or a fixed offset ("+07:00").
#[derive(Clone, Copy, Debug)]
pub enum SourceTimezone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl FromStr for SourceTimezone {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(tz) = s.parse::<Tz>() {
            return Ok(SourceTimezone::Named(tz));
        }
        if let Ok(offset) = s.parse::<FixedOffset>() {
            return Ok(SourceTimezone::Fixed(offset));
        }
        anyhow::bail!("unrecognized source timezone: {s}")
    }
}

impl SourceTimezone {
    /// Interpret a naive wall-clock time in this zone as a UTC instant.
    /// Ambiguous local times (DST fold) resolve to the earlier mapping;
    /// nonexistent ones are treated as missing.
    fn to_utc(self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            SourceTimezone::Named(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            SourceTimezone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CleaningConfig {
    pub source_timezone: SourceTimezone,
    /// Drop the leading rows only when the batch exceeds this size.
    pub leading_row_drop_threshold: usize,
    pub leading_row_drop_count: usize,
    /// Content-based filter: discard rows polled before this UTC instant.
    pub drop_polled_before: Option<DateTime<Utc>>,
}

/// Per-batch counters returned alongside the cleaned rows. Row-level issues
/// never surface as errors; they land here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub rows_in: usize,
    pub leading_rows_dropped: usize,
    pub rows_dropped_missing_fields: usize,
    pub rows_dropped_by_cutoff: usize,
    pub fields_coerced: usize,
    pub duplicates_removed: usize,
    pub rows_out: usize,
}

/// Normalize a raw listing batch into the canonical cleaned table.
///
/// Steps, in order: positional leading-row drop, timestamp normalization to
/// UTC, optional poll-time cutoff, numeric coercion, required-field
/// filtering, stable sort by `(coin_id, timestamp_utc)`, dedup keeping the
/// last row of each key run. The slug column is pruned by construction:
/// the cleaned record simply has no field for it.
pub fn clean(
    mut rows: Vec<RawPriceRecord>,
    config: &CleaningConfig,
) -> (Vec<CleanedPriceRecord>, CleanReport) {
    let mut report = CleanReport {
        rows_in: rows.len(),
        ..CleanReport::default()
    };

    if rows.len() > config.leading_row_drop_threshold && config.leading_row_drop_count > 0 {
        let count = config.leading_row_drop_count.min(rows.len());
        rows.drain(..count);
        report.leading_rows_dropped = count;
        debug!("dropped {count} leading rows assumed to be manual/test entries");
    }

    let mut cleaned: Vec<CleanedPriceRecord> = Vec::with_capacity(rows.len());
    for row in rows {
        // slug is pruned here: it has no column in the cleaned schema.
        let RawPriceRecord {
            coin_id,
            name,
            symbol,
            slug: _,
            cmc_rank,
            price,
            volume_24h,
            market_cap,
            percent_change_1h,
            percent_change_24h,
            percent_change_7d,
            last_updated,
            polled_at,
        } = row;

        let last_updated_utc = match last_updated.as_deref() {
            Some(text) => {
                let parsed = parse_utc_timestamp(text);
                if parsed.is_none() {
                    report.fields_coerced += 1;
                    warn!("unparsable last_updated {text:?}, treating as missing");
                }
                parsed
            }
            None => None,
        };

        let timestamp_utc = match polled_at.as_deref() {
            Some(text) => {
                let parsed = parse_local_timestamp(text, config.source_timezone);
                if parsed.is_none() {
                    report.fields_coerced += 1;
                    warn!("unparsable polled_at {text:?}, treating as missing");
                }
                parsed
            }
            None => None,
        };

        let price = coerce_f64("price", price, &mut report);
        let volume_24h = coerce_f64("volume_24h", volume_24h, &mut report);
        let market_cap = coerce_f64("market_cap", market_cap, &mut report);
        let percent_change_1h = coerce_f64("percent_change_1h", percent_change_1h, &mut report);
        let percent_change_24h = coerce_f64("percent_change_24h", percent_change_24h, &mut report);
        let percent_change_7d = coerce_f64("percent_change_7d", percent_change_7d, &mut report);

        let (Some(coin_id), Some(name), Some(symbol), Some(timestamp_utc)) =
            (coin_id, name, symbol, timestamp_utc)
        else {
            report.rows_dropped_missing_fields += 1;
            continue;
        };

        if let Some(cutoff) = config.drop_polled_before {
            if timestamp_utc < cutoff {
                report.rows_dropped_by_cutoff += 1;
                continue;
            }
        }

        cleaned.push(CleanedPriceRecord {
            id: None,
            coin_id,
            name,
            symbol,
            cmc_rank,
            price,
            volume_24h,
            market_cap,
            percent_change_1h,
            percent_change_24h,
            percent_change_7d,
            last_updated_utc,
            timestamp_utc,
        });
    }

    // Stable sort, so rows sharing a dedup key keep their insertion order
    // and keep-last picks the most recently polled of true duplicates.
    cleaned.sort_by(|a, b| {
        (a.coin_id, a.timestamp_utc).cmp(&(b.coin_id, b.timestamp_utc))
    });

    let mut deduped: Vec<CleanedPriceRecord> = Vec::with_capacity(cleaned.len());
    for record in cleaned {
        let is_duplicate = deduped
            .last()
            .is_some_and(|prev| dedup_key(prev) == dedup_key(&record));
        if is_duplicate {
            report.duplicates_removed += 1;
            if let Some(last) = deduped.last_mut() {
                *last = record;
            }
        } else {
            deduped.push(record);
        }
    }

    report.rows_out = deduped.len();
    (deduped, report)
}

pub fn dedup_key(record: &CleanedPriceRecord) -> (i64, DateTime<Utc>) {
    (record.coin_id, record.timestamp_utc)
}

/// Re-apply the keep-last dedup rule over an already-merged row set. Used by
/// sinks in append-merge mode, where incoming rows are appended after the
/// existing ones so they win ties.
pub fn merge_dedup(mut rows: Vec<CleanedPriceRecord>) -> Vec<CleanedPriceRecord> {
    rows.sort_by(|a, b| dedup_key(a).cmp(&dedup_key(b)));

    let mut merged: Vec<CleanedPriceRecord> = Vec::with_capacity(rows.len());
    for record in rows {
        let is_duplicate = merged
            .last()
            .is_some_and(|prev| dedup_key(prev) == dedup_key(&record));
        if is_duplicate {
            if let Some(last) = merged.last_mut() {
                *last = record;
            }
        } else {
            merged.push(record);
        }
    }

    merged
}

fn parse_utc_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive values in the raw store are UTC-labeled upstream.
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_local_timestamp(text: &str, tz: SourceTimezone) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return tz.to_utc(naive);
    }
    // Offset-labeled values need no localization.
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn coerce_f64(field: &str, value: Option<Value>, report: &mut CleanReport) -> Option<f64> {
    let value = value?;
    if value.is_null() {
        return None;
    }
    let parsed = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    if parsed.is_none() {
        report.fields_coerced += 1;
        warn!("unparsable {field} value {value}, treating as missing");
    }
    parsed
}
