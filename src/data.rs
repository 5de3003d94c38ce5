use serde::Serialize;

/// Per-cycle outcome broadcast to WebSocket subscribers after each poll.
#[derive(Clone, Debug, Serialize)]
pub struct CycleSummary {
    pub cycle_at: u64,
    pub rows_in: usize,
    pub rows_out: usize,
    pub leading_rows_dropped: usize,
    pub rows_dropped_missing_fields: usize,
    pub rows_dropped_by_cutoff: usize,
    pub fields_coerced: usize,
    pub duplicates_removed: usize,
}
