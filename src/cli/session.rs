use super::ui;
use crate::core::credential::Credential;
use comfy_table::{Cell, Table};

/// Prints what was harvested for `identity`, without cookie values.
pub fn show(identity: &str, credential: &Credential) {
    println!(
        "{} {}",
        ui::style_text(&format!("Session acquired for {identity}"), ui::StyleType::Value),
        ui::style_text(
            &format!("at {}", credential.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")),
            ui::StyleType::Subtle
        )
    );
    println!("{}", cookie_table(credential));
}

fn cookie_table(credential: &Credential) -> Table {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Cookie"),
        ui::header_cell("Domain"),
        ui::header_cell("Path"),
    ]);
    for cookie in &credential.cookies {
        table.add_row(vec![
            Cell::new(&cookie.name),
            Cell::new(&cookie.domain),
            Cell::new(&cookie.path),
        ]);
    }
    if let Some(hint) = credential.expires_hint {
        table.add_row(vec![
            Cell::new(ui::style_text("expires", ui::StyleType::Label)),
            Cell::new(hint.format("%Y-%m-%d %H:%M UTC")),
            Cell::new(""),
        ]);
    }
    table
}
