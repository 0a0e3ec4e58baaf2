//! Price extraction: an ordered chain of CSS selectors, then the page's
//! embedded config object as a last resort.

use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::record::sentinel;
use crate::session::Page;
use crate::tasks::Task;

/// A price widget location. Promotion, presale and standard prices live in
/// different widgets and only one is rendered at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSelector {
    pub selector: String,
    pub label: String,
}

impl PriceSelector {
    pub fn new(selector: &str, label: &str) -> Self {
        Self {
            selector: selector.to_string(),
            label: label.to_string(),
        }
    }
}

pub struct ExtractionPipeline {
    selectors: Vec<PriceSelector>,
    selector_timeout: Duration,
    blob: ConfigBlob,
    image_selector: Option<String>,
}

impl ExtractionPipeline {
    pub fn new(selectors: Vec<PriceSelector>, selector_timeout: Duration, blob: ConfigBlob) -> Self {
        Self {
            selectors,
            selector_timeout,
            blob,
            image_selector: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let blob = ConfigBlob::new(&settings.config_marker, settings.price_path_segments())?;
        Ok(Self::new(settings.selectors.clone(), settings.selector_timeout(), blob)
            .with_image_selector(settings.image_selector.clone()))
    }

    pub fn with_image_selector(mut self, selector: Option<String>) -> Self {
        self.image_selector = selector;
        self
    }

    /// Best-effort price for a loaded page. Failures come back as sentinel strings.
    pub async fn extract(&self, page: &dyn Page, task: &Task) -> String {
        for entry in &self.selectors {
            if let Some(price) = self.try_selector(page, entry).await {
                info!("[OK] {} price via '{}': {}", entry.label, entry.selector, price);
                return price;
            }
        }

        info!(
            "All selectors missed on {} ({}), parsing page source",
            page.url(),
            task.platform
        );
        let outcome = match page.content().await {
            Ok(source) => self.blob.extract(&source),
            Err(e) => BlobOutcome::Malformed(format!("could not read page source: {e}")),
        };
        match &outcome {
            BlobOutcome::Price(p) => info!("[OK] price via {}: {}", self.blob.marker, p),
            BlobOutcome::MarkerMissing => warn!("No '{}' object on {}", self.blob.marker, page.url()),
            BlobOutcome::FieldMissing => {
                warn!("'{}' on {} has no price field", self.blob.marker, page.url())
            }
            BlobOutcome::Malformed(e) => {
                warn!("Could not parse '{}' on {}: {}", self.blob.marker, page.url(), e)
            }
        }
        outcome.into_price()
    }

    async fn try_selector(&self, page: &dyn Page, entry: &PriceSelector) -> Option<String> {
        let lookup = page.query_selector_text(&entry.selector, self.selector_timeout);
        match tokio::time::timeout(self.selector_timeout, lookup).await {
            Ok(Ok(text)) => text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
            Ok(Err(e)) => {
                debug!("Selector '{}' failed: {}", entry.selector, e);
                None
            }
            Err(_) => {
                debug!(
                    "Selector '{}' timed out after {:?}",
                    entry.selector, self.selector_timeout
                );
                None
            }
        }
    }

    /// Main product image, when an image selector is configured.
    pub async fn extract_image(&self, page: &dyn Page) -> Option<String> {
        let selector = self.image_selector.as_deref()?;
        for attr in ["src", "data-src", "content"] {
            let lookup = page.query_selector_attr(selector, attr, self.selector_timeout);
            match tokio::time::timeout(self.selector_timeout, lookup).await {
                Ok(Ok(Some(v))) => return Some(v),
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    debug!("Image selector '{}' failed: {}", selector, e);
                    return None;
                }
                Err(_) => return None,
            }
        }
        None
    }
}

// ── Embedded config object ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOutcome {
    Price(String),
    MarkerMissing,
    FieldMissing,
    Malformed(String),
}

impl BlobOutcome {
    pub fn into_price(self) -> String {
        match self {
            BlobOutcome::Price(p) => p,
            BlobOutcome::MarkerMissing => sentinel::NOT_FOUND_CONFIG.to_string(),
            BlobOutcome::FieldMissing => sentinel::NOT_FOUND.to_string(),
            BlobOutcome::Malformed(_) => sentinel::SOURCE_PARSE_ERROR.to_string(),
        }
    }
}

/// Locates `var <marker> = {...};` in page source and reads a nested field.
pub struct ConfigBlob {
    marker: String,
    pattern: Regex,
    price_path: Vec<String>,
}

impl ConfigBlob {
    pub fn new(marker: &str, price_path: Vec<String>) -> Result<Self> {
        let pattern = Regex::new(&format!(
            r"(?s)var\s+{}\s*=\s*(\{{.*?\}})\s*;",
            regex::escape(marker)
        ))?;
        Ok(Self {
            marker: marker.to_string(),
            pattern,
            price_path,
        })
    }

    pub fn extract(&self, source: &str) -> BlobOutcome {
        let Some(literal) = self.pattern.captures(source).and_then(|c| c.get(1)) else {
            return BlobOutcome::MarkerMissing;
        };
        let value = match parse_object_literal(literal.as_str()) {
            Ok(v) => v,
            Err(e) => return BlobOutcome::Malformed(e.to_string()),
        };

        let field = self
            .price_path
            .iter()
            .try_fold(&value, |node, key| node.get(key.as_str()));
        match field {
            Some(Value::String(s)) if !s.trim().is_empty() => BlobOutcome::Price(s.trim().to_string()),
            Some(Value::Number(n)) => BlobOutcome::Price(n.to_string()),
            _ => BlobOutcome::FieldMissing,
        }
    }
}

/// Parse a JS object literal: strict JSON after comment removal, then a
/// relaxed pass that quotes bare keys, converts single-quoted strings and
/// drops trailing commas.
fn parse_object_literal(literal: &str) -> serde_json::Result<Value> {
    match serde_json::from_str(&clean_js(literal, false)) {
        Ok(v) => Ok(v),
        Err(strict) => {
            debug!("Strict parse failed ({}), retrying relaxed", strict);
            serde_json::from_str(&clean_js(literal, true))
        }
    }
}

fn clean_js(src: &str, relaxed: bool) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '"' | '\'' => i = copy_string(&chars, i, relaxed, &mut out),
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            ',' if relaxed && closes_next(&chars, i + 1) => i += 1,
            c if relaxed && is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_part(chars[i]) {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let is_key = matches!(last_significant(&out), Some('{') | Some(','))
                    && next_significant(&chars, i) == Some(':');
                if is_key {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Copy a string literal starting at `start`, returning the index after it.
/// In relaxed mode single-quoted strings are rewritten as JSON strings.
fn copy_string(chars: &[char], start: usize, relaxed: bool, out: &mut String) -> usize {
    let quote = chars[start];
    let rewrite = relaxed && quote == '\'';
    out.push(if rewrite { '"' } else { quote });

    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                let escaped = chars.get(i + 1).copied();
                match escaped {
                    Some('\'') if rewrite => out.push('\''),
                    Some(e) => {
                        out.push('\\');
                        out.push(e);
                    }
                    None => out.push('\\'),
                }
                i += 2;
            }
            '"' if rewrite => {
                out.push_str("\\\"");
                i += 1;
            }
            c if c == quote => {
                out.push(if rewrite { '"' } else { quote });
                return i + 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    i
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn last_significant(out: &str) -> Option<char> {
    out.chars().rev().find(|c| !c.is_whitespace())
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}

fn closes_next(chars: &[char], from: usize) -> bool {
    matches!(next_significant(chars, from), Some('}') | Some(']'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::{FakeResponse, FakeSession};
    use crate::session::{BrowserSession, HtmlPage};

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    fn pipeline() -> ExtractionPipeline {
        let s = Settings::default();
        ExtractionPipeline::new(
            s.selectors.clone(),
            TIMEOUT,
            ConfigBlob::new("pageConfig", vec!["price".into(), "p".into()]).unwrap(),
        )
    }

    fn task() -> Task {
        Task::new("JD", "https://item.jd.com/100012043978.html")
    }

    fn blob() -> ConfigBlob {
        ConfigBlob::new("pageConfig", vec!["price".into(), "p".into()]).unwrap()
    }

    #[tokio::test]
    async fn first_matching_selector_wins() {
        // Both the promotion and the standard widget are present.
        let page = HtmlPage::new(task().url, fixture("promotion"));
        assert_eq!(pipeline().extract(&page, &task()).await, "3899.00");
    }

    #[tokio::test]
    async fn later_selector_used_when_earlier_missing() {
        let html = r#"<div class="p-price"><span class="price">129.90</span></div>"#;
        let page = HtmlPage::new(task().url, html);
        assert_eq!(pipeline().extract(&page, &task()).await, "129.90");
    }

    #[tokio::test]
    async fn empty_widget_falls_through() {
        let html = r#"<div id="J_FinalPrice"><span class="price">  </span></div>
            <span class="J-presale-price">88.00</span>"#;
        let page = HtmlPage::new(task().url, html);
        assert_eq!(pipeline().extract(&page, &task()).await, "88.00");
    }

    #[tokio::test]
    async fn config_blob_is_the_fallback() {
        let page = HtmlPage::new(task().url, fixture("config_only"));
        assert_eq!(pipeline().extract(&page, &task()).await, "5299.00");
    }

    #[tokio::test]
    async fn page_without_config_object() {
        let page = HtmlPage::new(task().url, "<html><body>sold out</body></html>");
        assert_eq!(pipeline().extract(&page, &task()).await, sentinel::NOT_FOUND_CONFIG);
    }

    #[tokio::test]
    async fn stalled_selector_does_not_block_the_chain() {
        let html = r#"<div id="J_FinalPrice"><span class="price">1.00</span></div>
            <span class="J-presale-price">2.00</span>"#;
        let session = FakeSession::new().with_response(
            &task().url,
            FakeResponse::Stalled {
                html: html.to_string(),
                stalled: vec!["#J_FinalPrice .price".to_string()],
            },
        );
        let page = session.navigate(&task().url, Duration::from_secs(1)).await.unwrap();
        let started = std::time::Instant::now();
        assert_eq!(pipeline().extract(page.as_ref(), &task()).await, "2.00");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn image_lookup_reads_src() {
        let html = r#"<img id="spec-img" data-origin="x" src="//img14.360buyimg.com/a.jpg">"#;
        let page = HtmlPage::new(task().url, html);
        let p = pipeline().with_image_selector(Some("#spec-img".into()));
        assert_eq!(p.extract_image(&page).await.as_deref(), Some("//img14.360buyimg.com/a.jpg"));
        assert_eq!(pipeline().extract_image(&page).await, None);
    }

    #[test]
    fn blob_strict_json_with_comments() {
        let src = r#"<script>
            var pageConfig = {
                "product": {"name": "X // not a comment"}, // trailing note
                "price": {"p": "19.90"}
            };
        </script>"#;
        assert_eq!(blob().extract(src), BlobOutcome::Price("19.90".into()));
    }

    #[test]
    fn blob_relaxed_object_literal() {
        let src = r#"var pageConfig = {
            compatible: true,
            product: { skuid: 100012043978, name: 'It\'s "new"', src: 'https://a.b/c' },
            /* block */
            price: { p: 59.5, },
        };"#;
        assert_eq!(blob().extract(src), BlobOutcome::Price("59.5".into()));
    }

    #[test]
    fn blob_without_price_field() {
        let src = r#"var pageConfig = {"product": {"skuid": 1}};"#;
        assert_eq!(blob().extract(src), BlobOutcome::FieldMissing);
        assert_eq!(BlobOutcome::FieldMissing.into_price(), sentinel::NOT_FOUND);
    }

    #[test]
    fn blob_empty_price_is_missing() {
        let src = r#"var pageConfig = {"price": {"p": ""}};"#;
        assert_eq!(blob().extract(src), BlobOutcome::FieldMissing);
        assert_eq!(blob().extract(src).into_price(), sentinel::NOT_FOUND);
    }

    #[test]
    fn blob_malformed() {
        let src = "var pageConfig = { price: { p: new Price(1) } };";
        let out = blob().extract(src);
        assert!(matches!(out, BlobOutcome::Malformed(_)));
        assert_eq!(out.into_price(), sentinel::SOURCE_PARSE_ERROR);
    }

    #[test]
    fn blob_marker_missing() {
        assert_eq!(blob().extract("var other = {};"), BlobOutcome::MarkerMissing);
        assert_eq!(
            blob().extract("<html>no config here</html>").into_price(),
            sentinel::NOT_FOUND_CONFIG
        );
    }

    #[test]
    fn custom_marker_and_path() {
        let b = ConfigBlob::new("__INIT$", vec!["item".into(), "price".into(), "now".into()]).unwrap();
        let src = r#"var __INIT$ = {"item": {"price": {"now": 7}}};"#;
        assert_eq!(b.extract(src), BlobOutcome::Price("7".into()));
    }
}
