use super::ui;
use crate::core::currency::Currency;
use comfy_table::{Cell, Table};

pub fn run(query: &str, found: &[&Currency]) {
    if found.is_empty() {
        println!(
            "{}",
            ui::style_text(&format!("No currency matches '{query}'"), ui::StyleType::Error)
        );
        return;
    }
    println!("{}", currency_table(found));
}

fn currency_table(found: &[&Currency]) -> Table {
    let mut table = ui::new_styled_table();
    table.set_header(vec![ui::header_cell("Code"), ui::header_cell("Currency")]);
    for currency in found {
        table.add_row(vec![Cell::new(currency.code), Cell::new(currency.name)]);
    }
    table
}
