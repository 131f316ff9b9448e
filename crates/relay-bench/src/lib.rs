//! Shared fixtures for the Relay benchmarks.

/// Instrument identifiers `SYM0-USD`, `SYM1-USD`, ...
#[must_use]
pub fn instruments(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("SYM{i}-USD")).collect()
}

/// A Coinbase-style `match` record for an instrument.
#[must_use]
pub fn trade_record(instrument: &str, sequence: u64) -> String {
    format!(
        r#"{{"type":"match","product_id":"{instrument}","trade_id":{sequence},"sequence":{sequence},"side":"buy","size":"0.01","price":"42000.00","time":"2024-01-01T00:00:00.000000Z"}}"#
    )
}

/// A Coinbase-style `l2update` record with `levels` changes.
#[must_use]
pub fn book_update_record(instrument: &str, levels: usize) -> String {
    let changes: Vec<String> = (0..levels)
        .map(|i| format!(r#"["buy","{}.00","0.5"]"#, 42_000 - i))
        .collect();
    format!(
        r#"{{"type":"l2update","product_id":"{instrument}","time":"2024-01-01T00:00:00.000000Z","changes":[{}]}}"#,
        changes.join(",")
    )
}
