use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "ods"];

/// One row of the task sheet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Task {
    #[serde(rename = "Platform", default)]
    pub platform: String,
    #[serde(rename = "URL", default)]
    pub url: String,
    #[serde(rename = "SKU", default)]
    pub sku: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidTask {
    #[error("URL '{0}' is not an absolute http(s) URL")]
    BadUrl(String),

    #[error("platform is empty")]
    MissingPlatform,
}

impl Task {
    pub fn new(platform: &str, url: &str) -> Self {
        Self {
            platform: platform.to_string(),
            url: url.to_string(),
            sku: None,
        }
    }

    #[cfg(test)]
    pub fn with_sku(mut self, sku: &str) -> Self {
        self.sku = Some(sku.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), InvalidTask> {
        if self.platform.trim().is_empty() {
            return Err(InvalidTask::MissingPlatform);
        }
        let url = self.url.trim();
        match url::Url::parse(url) {
            Ok(parsed)
                if matches!(parsed.scheme(), "http" | "https") && parsed.host().is_some() =>
            {
                Ok(())
            }
            _ => Err(InvalidTask::BadUrl(url.to_string())),
        }
    }
}

/// Read the task sheet, keeping rows for `platform` (all rows when `None`).
/// Workbooks (`.xlsx` and friends) use their first sheet; anything else is read as CSV.
pub fn load_tasks(path: &Path, platform: Option<&str>) -> Result<Vec<Task>> {
    let is_workbook = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| WORKBOOK_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));

    let tasks = if is_workbook {
        read_workbook(path)
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Task file not found: {:?}", path))?;
        read_csv(file)
    }
    .with_context(|| format!("Failed to read task file {:?}", path))?;

    Ok(select_platform(tasks, platform))
}

pub fn read_csv<R: Read>(reader: R) -> Result<Vec<Task>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    if !headers.iter().any(|h| h == "URL") {
        anyhow::bail!("missing required column 'URL' (found: {:?})", headers);
    }

    let mut tasks = Vec::new();
    for (i, row) in rdr.deserialize::<Task>().enumerate() {
        match row {
            Ok(t) => tasks.push(t),
            // +2: header line plus 1-based numbering
            Err(e) => warn!("Skipping unreadable task row {}: {}", i + 2, e),
        }
    }
    Ok(tasks)
}

/// First sheet of a workbook; the first row holds the column names.
pub fn read_workbook(path: &Path) -> Result<Vec<Task>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Task workbook not found or unreadable: {:?}", path))?;
    let range = workbook
        .worksheet_range_at(0)
        .context("workbook has no sheets")??;

    let mut rows = range.rows();
    let headers: Vec<String> = match rows.next() {
        Some(row) => row.iter().map(cell_text).collect(),
        None => return Ok(Vec::new()),
    };
    let column = |name: &str| headers.iter().position(|h| h == name);
    let Some(url_col) = column("URL") else {
        anyhow::bail!("missing required column 'URL' (found: {:?})", headers);
    };
    let platform_col = column("Platform");
    let sku_col = column("SKU");

    let cell = |row: &[Data], col: Option<usize>| {
        col.and_then(|c| row.get(c)).map(cell_text).unwrap_or_default()
    };
    let tasks = rows
        .filter(|row| row.iter().any(|c| !matches!(c, Data::Empty)))
        .map(|row| {
            let sku = cell(row, sku_col);
            Task {
                platform: cell(row, platform_col),
                url: cell(row, Some(url_col)),
                sku: (!sku.is_empty()).then_some(sku),
            }
        })
        .collect();
    Ok(tasks)
}

/// Spreadsheet cell as trimmed text. Whole numbers lose the `.0` so numeric
/// SKU ids read the same as they do in CSV.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string().trim().to_string(),
    }
}

fn select_platform(tasks: Vec<Task>, platform: Option<&str>) -> Vec<Task> {
    let total = tasks.len();
    let Some(p) = platform else {
        info!("Read {} tasks", total);
        return tasks;
    };
    let kept: Vec<Task> = tasks.into_iter().filter(|t| t.platform == p).collect();
    info!("Read {} tasks, {} for platform '{}'", total, kept.len(), p);
    kept
}
