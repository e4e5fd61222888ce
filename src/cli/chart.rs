use super::ui;
use crate::core::chart::{ChartData, ChartService, Freshness};
use crate::core::rates::{CurrencyPair, Period, RateSeries};
use anyhow::{Context, Result};
use comfy_table::{Cell, Table};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

const SPARK_LEVELS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

pub async fn run(service: &ChartService, pair: &CurrencyPair, period: Period, json: bool) -> Result<()> {
    let pb = ui::new_spinner(format!("Loading {pair} {period}"));
    let result = service
        .get_chart_with_progress(pair, period, |status| {
            pb.set_message(format!("Fetching {pair} {period}: {status}"));
        })
        .await;
    pb.finish_and_clear();
    let chart = result.with_context(|| format!("Failed to load chart for {pair} {period}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&chart)?);
    } else {
        println!(
            "\n{} {}",
            ui::style_text(&pair.to_string(), ui::StyleType::Title),
            ui::style_text(&format!("({period})"), ui::StyleType::Subtle)
        );
        println!("{}", sparkline(&chart.series));
        println!("{}", summary_table(&chart));
        println!("{}", points_table(&chart.series));
    }

    if chart.freshness == Freshness::Stale {
        finish_refresh(service, pair, period, json).await;
    }
    Ok(())
}

/// Waits for the refresh a stale chart started, so it lands in the cache
/// before the process exits.
async fn finish_refresh(service: &ChartService, pair: &CurrencyPair, period: Period, quiet: bool) {
    let pb = ui::new_spinner(format!("Refreshing {pair} {period}"));
    let outcome = service.scheduler().schedule(pair, period).wait().await;
    pb.finish_and_clear();

    match outcome {
        Ok(entry) => {
            info!(%pair, %period, version = %entry.source_version, "Stale chart refreshed");
            if !quiet {
                println!(
                    "{}",
                    ui::style_text(
                        &format!("Cache refreshed with rates up to {}", entry.source_version),
                        ui::StyleType::Subtle
                    )
                );
            }
        }
        Err(e) => warn!(%pair, %period, error = %e, "Refresh failed, cached chart kept"),
    }
}

fn summary_table(chart: &ChartData) -> Table {
    let series = &chart.series;
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("First"),
        ui::header_cell("Last"),
        ui::header_cell("Low"),
        ui::header_cell("High"),
        ui::header_cell("Change"),
        ui::header_cell("Days"),
        ui::header_cell("Fetched"),
        ui::header_cell("Status"),
    ]);
    table.add_row(vec![
        ui::rate_cell(series.first().rate),
        ui::rate_cell(series.last().rate),
        ui::rate_cell(series.min_rate()),
        ui::rate_cell(series.max_rate()),
        ui::change_cell(series.change_pct()),
        Cell::new(series.len()),
        Cell::new(chart.fetched_at.format("%Y-%m-%d %H:%M UTC")),
        ui::freshness_cell(chart.freshness),
    ]);
    table
}

fn points_table(series: &RateSeries) -> Table {
    let mut table = ui::new_styled_table();
    table.set_header(vec![ui::header_cell("Date"), ui::header_cell("Rate")]);
    for point in series.points().iter().rev() {
        table.add_row(vec![
            Cell::new(point.t.format("%Y-%m-%d (%a)")),
            ui::rate_cell(point.rate),
        ]);
    }
    table
}

/// One block character per point, scaled between the series low and high.
fn sparkline(series: &RateSeries) -> String {
    let (low, high) = (series.min_rate(), series.max_rate());
    let span = high - low;
    let top = Decimal::from(SPARK_LEVELS.len() - 1);
    series
        .points()
        .iter()
        .map(|point| {
            if span.is_zero() {
                return SPARK_LEVELS[SPARK_LEVELS.len() / 2];
            }
            let level = ((point.rate - low) / span * top).round();
            let index = level.to_usize().unwrap_or(0);
            SPARK_LEVELS[index.min(SPARK_LEVELS.len() - 1)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fetcher::tests::{ScriptedSource, sample_series};
    use crate::core::rates::RatePoint;
    use crate::core::scheduler::Bootstrap;
    use crate::core::scheduler::tests::{fixture, in_flight, pair};
    use chrono::{NaiveDate, Utc};
    use std::time::Duration;

    fn series(rates: &[i64]) -> RateSeries {
        let start = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        RateSeries::new(
            rates
                .iter()
                .zip(start.iter_days())
                .map(|(rate, day)| RatePoint::on_date(day, Decimal::new(*rate, 2)))
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_stale_chart_refresh_completes_before_return() {
        let fx = fixture(ScriptedSource::with_delay(vec![], Duration::from_millis(50)));
        let eur_gbp = pair("EUR", "GBP");
        fx.cache
            .put_at(
                &eur_gbp,
                Period::SevenDays,
                series(&[85, 86]),
                "2025-01-07",
                Utc::now() - chrono::Duration::hours(3),
            )
            .unwrap();
        let service = ChartService::new(fx.scheduler.clone(), Bootstrap::completed());

        run(&service, &eur_gbp, Period::SevenDays, true).await.unwrap();

        let entry = fx.cache.get(&eur_gbp, Period::SevenDays).unwrap();
        assert!(!fx.cache.is_stale(&entry));
        assert_eq!(entry.series, sample_series(100));
        assert!(!in_flight(&fx.scheduler, &eur_gbp, Period::SevenDays));
        assert_eq!(fx.source.calls(), 1);
    }

    #[tokio::test]
    async fn test_fresh_chart_starts_no_refresh() {
        let fx = fixture(ScriptedSource::new(vec![]));
        let eur_gbp = pair("EUR", "GBP");
        fx.cache
            .put(&eur_gbp, Period::SevenDays, series(&[85, 86]), "2025-01-07")
            .unwrap();
        let service = ChartService::new(fx.scheduler.clone(), Bootstrap::completed());

        run(&service, &eur_gbp, Period::SevenDays, true).await.unwrap();
        assert_eq!(fx.source.calls(), 0);
    }

    #[test]
    fn test_sparkline_scales_to_range() {
        assert_eq!(sparkline(&series(&[100, 150, 200])), "▁▅█");
        assert_eq!(sparkline(&series(&[100, 100])), "▅▅");
    }

    #[test]
    fn test_tables_render_rates() {
        let chart = ChartData {
            series: series(&[2500, 2520, 2480]),
            freshness: Freshness::Stale,
            fetched_at: Utc::now(),
        };

        let summary = summary_table(&chart).to_string();
        assert!(summary.contains("24.8"));
        assert!(summary.contains("25.2"));
        assert!(summary.contains("-0.80%"));
        assert!(summary.contains("stale"));

        let points = points_table(&chart.series).to_string();
        assert!(points.contains("2025-01-08 (Wed)"));
        // Newest first
        assert!(points.find("2025-01-08").unwrap() < points.find("2025-01-06").unwrap());
    }
}
