use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::tasks::Task;

pub const DEFAULT_SKU: &str = "default";

/// Fixed price strings recording why no price was captured.
pub mod sentinel {
    pub const PAGE_TIMEOUT: &str = "Page Timeout";
    pub const PAGE_ERROR: &str = "Page Error";
    pub const NOT_FOUND: &str = "Not Found";
    pub const NOT_FOUND_CONFIG: &str = "Not Found (Config)";
    pub const SOURCE_PARSE_ERROR: &str = "Error (Source Parse)";

    pub const ALL: [&str; 5] = [
        PAGE_TIMEOUT,
        PAGE_ERROR,
        NOT_FOUND,
        NOT_FOUND_CONFIG,
        SOURCE_PARSE_ERROR,
    ];

    pub fn is_sentinel(price: &str) -> bool {
        ALL.contains(&price)
    }
}

/// One observation slot: (platform, url, sku_identifier, scrape_date) is unique in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub platform: String,
    pub url: String,
    pub sku_identifier: String,
    pub price: String,
    pub scrape_date: NaiveDate,
    pub main_image_url: Option<String>,
}

impl Record {
    pub fn is_failure(&self) -> bool {
        sentinel::is_sentinel(&self.price)
    }

    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.main_image_url = image.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        self
    }
}

/// Map a task and its extraction result to a record stamped with the run date.
pub fn build(task: &Task, price: impl Into<String>, today: NaiveDate) -> Record {
    let sku_identifier = task
        .sku
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SKU)
        .to_string();

    Record {
        platform: task.platform.trim().to_string(),
        url: task.url.trim().to_string(),
        sku_identifier,
        price: price.into(),
        scrape_date: today,
        main_image_url: None,
    }
}
