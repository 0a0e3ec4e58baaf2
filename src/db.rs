use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::record::Record;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Price table with one row per (platform, url, sku, date).
pub struct UpsertStore {
    conn: Connection,
}

impl UpsertStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create directory {:?}", dir))?;
                info!("Created directory {:?}", dir);
            }
        }
        let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Insert new observation slots, overwrite the price of existing ones.
    /// The batch commits as a whole or not at all.
    pub fn upsert(&mut self, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            debug!("No records to save");
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        init_schema(&tx)?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO price_data
                 (Platform, URL, SKU_Identifier, Price, Scrape_Date, Main_Image_URL)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(Platform, URL, SKU_Identifier, Scrape_Date)
                 DO UPDATE SET Price = excluded.Price",
            )?;
            for r in records {
                count += stmt
                    .execute(rusqlite::params![
                        r.platform,
                        r.url,
                        r.sku_identifier,
                        r.price,
                        r.scrape_date.format(DATE_FORMAT).to_string(),
                        r.main_image_url,
                    ])
                    .with_context(|| format!("Failed to save price for {}", r.url))?;
            }
        }
        tx.commit().context("Failed to commit price batch")?;
        info!("Saved {} records ({} rows inserted or updated)", records.len(), count);
        Ok(count)
    }

    pub fn row_count(&self) -> Result<usize> {
        let n: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM price_data", [], |r| r.get(0))?;
        Ok(n)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS price_data (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            Platform       TEXT NOT NULL,
            URL            TEXT NOT NULL,
            SKU_Identifier TEXT NOT NULL,
            Price          TEXT,
            Scrape_Date    TEXT NOT NULL,
            Main_Image_URL TEXT,
            UNIQUE(Platform, URL, SKU_Identifier, Scrape_Date)
        );
        CREATE INDEX IF NOT EXISTS idx_price_data_date ON price_data(Scrape_Date);
        ",
    )?;
    Ok(())
}
