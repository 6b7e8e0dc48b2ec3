//! Read the log directly, without a running server.

use std::path::Path;

use airlog_core::config::HISTORY_LIMIT;
use airlog_core::{Store, StoreError, StoredReading};

fn open(db: &Path) -> Store {
    match Store::open(db) {
        Ok(s) if s.is_initialized() => s,
        Ok(_) => {
            eprintln!(
                "Database {} has no readings table. Run 'airlog init-db' or 'airlog serve' first.",
                db.display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot open {}: {e}", db.display());
            std::process::exit(1);
        }
    }
}

fn fail(e: StoreError) -> ! {
    eprintln!("Query failed: {e}");
    std::process::exit(1);
}

pub fn format_row(row: &StoredReading) -> String {
    format!(
        "{:>8}  {}  {:>7.2}  {:>7.2}  {:>6}",
        row.id,
        row.timestamp.format("%Y-%m-%d %H:%M:%S"),
        row.temperature,
        row.humidity,
        row.co2
    )
}

fn print_header() {
    println!(
        "{:>8}  {:<19}  {:>7}  {:>7}  {:>6}",
        "id", "timestamp (UTC)", "temp °C", "hum %", "ppm"
    );
}

pub fn latest(db: &Path) {
    let store = open(db);
    match store.latest() {
        Ok(Some(row)) => {
            print_header();
            println!("{}", format_row(&row));
        }
        Ok(None) => println!("No data available"),
        Err(e) => fail(e),
    }
}

pub fn history(db: &Path, limit: usize) {
    let store = open(db);
    let limit = limit.clamp(1, HISTORY_LIMIT);
    match store.history(limit) {
        Ok(rows) if rows.is_empty() => println!("No data available"),
        Ok(rows) => {
            print_header();
            for row in &rows {
                println!("{}", format_row(row));
            }
        }
        Err(e) => fail(e),
    }
}
