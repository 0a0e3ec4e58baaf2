use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::extract::PriceSelector;

const DEFAULT_CONFIG_NAME: &str = "pricewatch";
const ENV_PREFIX: &str = "PRICEWATCH";

/// Runtime settings. Layered: defaults, config file, `PRICEWATCH_*` env, CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub tasks_path: PathBuf,
    /// Only tasks whose platform equals this value are run. `None` runs all.
    pub platform: Option<String>,
    pub concurrency: usize,
    pub navigation_timeout_secs: u64,
    pub selector_timeout_ms: u64,
    pub task_delay_ms: u64,
    /// Browserless-compatible render service. Without it pages are fetched directly.
    pub render_endpoint: Option<String>,
    pub render_token: Option<String>,
    /// Browser storage-state JSON whose cookies are sent with every page load.
    pub auth_state_path: Option<PathBuf>,
    pub user_agent: String,
    pub selectors: Vec<PriceSelector>,
    pub config_marker: String,
    /// Dotted path of the price inside the embedded config blob.
    pub price_path: String,
    pub image_selector: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/prices.sqlite"),
            tasks_path: PathBuf::from("products.xlsx"),
            platform: None,
            concurrency: 1,
            navigation_timeout_secs: 30,
            selector_timeout_ms: 2000,
            task_delay_ms: 0,
            render_endpoint: None,
            render_token: None,
            auth_state_path: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            selectors: vec![
                PriceSelector::new("#J_FinalPrice .price", "promotion"),
                PriceSelector::new(".J-presale-price", "presale"),
                PriceSelector::new(".p-price .price", "standard"),
            ],
            config_marker: "pageConfig".to_string(),
            price_path: "price.p".to_string(),
            image_selector: None,
        }
    }
}

impl Settings {
    /// Load settings. An explicit `path` must exist; otherwise `pricewatch.toml`
    /// in the working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p.to_path_buf()).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };
        let builder = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));
        Self::from_builder(builder).with_context(|| match path {
            Some(p) => format!("Failed to load config from {:?}", p),
            None => "Failed to load config".to_string(),
        })
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    #[cfg(test)]
    pub fn from_toml(toml: &str) -> Result<Self> {
        Self::from_builder(
            Config::builder().add_source(File::from_str(toml, ::config::FileFormat::Toml)),
        )
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.selector_timeout() >= self.navigation_timeout() {
            anyhow::bail!(
                "selector_timeout_ms ({}) must be shorter than the navigation timeout ({}s)",
                self.selector_timeout_ms,
                self.navigation_timeout_secs
            );
        }
        if self.price_path.split('.').any(|seg| seg.trim().is_empty()) {
            anyhow::bail!("price_path {:?} has an empty segment", self.price_path);
        }
        Ok(())
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn selector_timeout(&self) -> Duration {
        Duration::from_millis(self.selector_timeout_ms)
    }

    pub fn task_delay(&self) -> Duration {
        Duration::from_millis(self.task_delay_ms)
    }

    pub fn price_path_segments(&self) -> Vec<String> {
        self.price_path.split('.').map(|s| s.trim().to_string()).collect()
    }

    /// Records that could not be written are dumped here for a later retry.
    pub fn pending_path(&self) -> PathBuf {
        let mut name = self.db_path.as_os_str().to_owned();
        name.push(".pending.json");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_known_price_widgets() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.concurrency, 1);
        assert_eq!(s.navigation_timeout(), Duration::from_secs(30));
        assert_eq!(s.selector_timeout(), Duration::from_millis(2000));
        let order: Vec<&str> = s.selectors.iter().map(|p| p.selector.as_str()).collect();
        assert_eq!(order, ["#J_FinalPrice .price", ".J-presale-price", ".p-price .price"]);
        assert_eq!(s.price_path_segments(), ["price", "p"]);
        assert!(s.auth_state_path.is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let s = Settings::from_toml(
            r#"
            db_path = "out/x.sqlite"
            platform = "JD"
            concurrency = 3
            price_path = "item.price.now"
            auth_state_path = "auth/jd.json"

            [[selectors]]
            selector = ".now-price"
            label = "now"
            "#,
        )
        .unwrap();
        assert_eq!(s.db_path, PathBuf::from("out/x.sqlite"));
        assert_eq!(s.platform.as_deref(), Some("JD"));
        assert_eq!(s.concurrency, 3);
        assert_eq!(s.selectors.len(), 1);
        assert_eq!(s.selectors[0].label, "now");
        assert_eq!(s.price_path_segments(), ["item", "price", "now"]);
        assert_eq!(s.pending_path(), PathBuf::from("out/x.sqlite.pending.json"));
        assert_eq!(s.auth_state_path, Some(PathBuf::from("auth/jd.json")));
    }

    #[test]
    fn selector_timeout_must_undercut_navigation() {
        let err = Settings::from_toml("navigation_timeout_secs = 1\nselector_timeout_ms = 5000")
            .unwrap_err();
        assert!(err.to_string().contains("selector_timeout_ms"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(Settings::from_toml("concurrency = 0").is_err());
    }
}
