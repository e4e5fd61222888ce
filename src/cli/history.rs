use super::ui;
use crate::core::history::HistoryRecord;
use comfy_table::{Cell, Table};

pub fn run(records: &[HistoryRecord]) {
    if records.is_empty() {
        println!("No charts viewed yet. Try `fxchart chart --base USD --quote JPY`.");
        return;
    }
    println!("{}", history_table(records));
}

fn history_table(records: &[HistoryRecord]) -> Table {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Pair"),
        ui::header_cell("Periods"),
        ui::header_cell("Last viewed"),
    ]);
    for record in records {
        let periods: Vec<&str> = record.cached_periods.iter().map(|p| p.as_str()).collect();
        table.add_row(vec![
            Cell::new(&record.pair),
            Cell::new(periods.join(", ")),
            Cell::new(record.last_viewed_at.format("%Y-%m-%d %H:%M UTC")),
        ]);
    }
    table
}
