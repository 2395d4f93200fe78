use crate::storage::CachedSeries;
use chrono::DateTime;
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

pub fn format_timestamp(ts_ms: i64) -> String {
    match DateTime::from_timestamp_millis(ts_ms) {
        Some(dt) => dt.format("%d-%m-%Y %H:%M:%S").to_string(),
        None => "Unknown Time".to_string(),
    }
}

/// Renders the cached series as a table, or a notice when there are none.
pub fn render_status(entries: &[CachedSeries]) -> String {
    if entries.is_empty() {
        return "No cached series found.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Symbol").add_attribute(Attribute::Bold),
            Cell::new("Interval").add_attribute(Attribute::Bold),
            Cell::new("Candles")
                .add_attribute(Attribute::Bold)
                .set_alignment(CellAlignment::Right),
            Cell::new("First (UTC)").add_attribute(Attribute::Bold),
            Cell::new("Last (UTC)").add_attribute(Attribute::Bold),
        ]);

    for entry in entries {
        let first = entry.first_open_time.map(format_timestamp).unwrap_or_else(|| "-".to_string());
        let last = entry.last_open_time.map(format_timestamp).unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&entry.symbol).fg(Color::Cyan),
            Cell::new(entry.interval),
            Cell::new(entry.candles).set_alignment(CellAlignment::Right),
            Cell::new(first).fg(Color::DarkGrey),
            Cell::new(last).fg(Color::Green),
        ]);
    }

    table.to_string()
}
