use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::AuthState;
use crate::config::Settings;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("navigation timed out after {0:?}")]
    Timeout(Duration),

    #[error("navigation failed: {0}")]
    Navigation(String),

    /// The session itself is unusable; no further task can succeed.
    #[error("browser session lost: {0}")]
    Disconnected(String),
}

impl SessionError {
    pub fn is_session_level(&self) -> bool {
        matches!(self, SessionError::Disconnected(_))
    }
}

/// A loaded page. Lookups are bounded by the caller-supplied timeout.
#[async_trait]
pub trait Page: Send + Sync {
    fn url(&self) -> &str;

    /// Trimmed text of the first element matching `selector`, if any.
    async fn query_selector_text(&self, selector: &str, timeout: Duration)
        -> Result<Option<String>>;

    async fn query_selector_attr(
        &self,
        selector: &str,
        attr: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Full page source.
    async fn content(&self) -> Result<String>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<Box<dyn Page>, SessionError>;

    fn name(&self) -> &str;
}

// ── Static HTML page ──

/// Snapshot of a page's markup, queried with CSS selectors.
pub struct HtmlPage {
    url: String,
    html: String,
}

impl HtmlPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }

    fn select_first(
        &self,
        selector: &str,
        read: impl Fn(scraper::ElementRef<'_>) -> Option<String>,
    ) -> Result<Option<String>> {
        let sel = Selector::parse(selector)
            .map_err(|e| anyhow::anyhow!("Invalid selector {:?}: {}", selector, e))?;
        // Html is !Send, so it is parsed per lookup and dropped before any await.
        let document = Html::parse_document(&self.html);
        let found = document
            .select(&sel)
            .next()
            .and_then(read)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(found)
    }
}

#[async_trait]
impl Page for HtmlPage {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query_selector_text(
        &self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<Option<String>> {
        self.select_first(selector, |el| Some(el.text().collect::<String>()))
    }

    async fn query_selector_attr(
        &self,
        selector: &str,
        attr: &str,
        _timeout: Duration,
    ) -> Result<Option<String>> {
        self.select_first(selector, |el| el.value().attr(attr).map(str::to_string))
    }

    async fn content(&self) -> Result<String> {
        Ok(self.html.clone())
    }
}

// ── HTTP session ──

struct RenderEndpoint {
    base_url: String,
    token: Option<String>,
}

/// Loads pages over HTTP, optionally through a Browserless-style `/content`
/// render service so script-built price widgets are present in the markup.
/// Cookies from a saved login are attached to every page load.
pub struct HttpSession {
    client: reqwest::Client,
    render: Option<RenderEndpoint>,
    auth: Option<AuthState>,
}

fn client_builder(user_agent: &str) -> reqwest::ClientBuilder {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    reqwest::Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(5))
}

impl HttpSession {
    pub fn new(user_agent: &str, render_endpoint: Option<&str>, token: Option<&str>) -> Result<Self> {
        let client = client_builder(user_agent)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self::with_client(client, render_endpoint, token))
    }

    fn with_client(
        client: reqwest::Client,
        render_endpoint: Option<&str>,
        token: Option<&str>,
    ) -> Self {
        let render = render_endpoint.map(|base| RenderEndpoint {
            base_url: base.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        });
        Self {
            client,
            render,
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<AuthState>) -> Self {
        self.auth = auth;
        self
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let auth = match &settings.auth_state_path {
            Some(path) => {
                let auth = AuthState::load(path)?;
                info!("Loaded {} cookies from {:?}", auth.cookie_count(), path);
                Some(auth)
            }
            None => None,
        };
        let session = Self::new(
            &settings.user_agent,
            settings.render_endpoint.as_deref(),
            settings.render_token.as_deref(),
        )?
        .with_auth(auth);
        match &session.render {
            Some(r) => info!("Rendering pages through {}", r.base_url),
            None => info!("Fetching pages directly (no render endpoint configured)"),
        }
        Ok(session)
    }

    async fn fetch_direct(&self, url: &str, timeout: Duration) -> Result<String, SessionError> {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(cookies) = self.auth.as_ref().and_then(|a| a.cookie_header(url)) {
            request = request.header(reqwest::header::COOKIE, cookies);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| page_error(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SessionError::Navigation(format!("HTTP {} for {}", status, url)));
        }
        resp.text().await.map_err(|e| page_error(e, timeout))
    }

    async fn fetch_rendered(
        &self,
        render: &RenderEndpoint,
        url: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        let endpoint = format!("{}/content", render.base_url);
        let cookies = self
            .auth
            .as_ref()
            .map(|a| a.cookies_for(url))
            .unwrap_or_default();
        let body = serde_json::json!({
            "url": url,
            "cookies": cookies,
            "gotoOptions": {
                "waitUntil": "domcontentloaded",
                "timeout": timeout.as_millis() as u64,
            },
        });

        let mut request = self.client.post(&endpoint).timeout(timeout).json(&body);
        if let Some(ref token) = render.token {
            request = request.query(&[("token", token)]);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    SessionError::Disconnected(format!("render endpoint unreachable: {e}"))
                } else {
                    page_error(e, timeout)
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SessionError::Disconnected(format!(
                "render endpoint rejected credentials (HTTP {})",
                status
            )));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            let first = message.lines().next().unwrap_or_default();
            return Err(SessionError::Navigation(format!("render HTTP {}: {}", status, first)));
        }
        resp.text().await.map_err(|e| page_error(e, timeout))
    }
}

fn page_error(err: reqwest::Error, timeout: Duration) -> SessionError {
    if err.is_timeout() {
        SessionError::Timeout(timeout)
    } else {
        SessionError::Navigation(err.to_string())
    }
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<Box<dyn Page>, SessionError> {
        debug!("Navigating to {}", url);
        let html = match &self.render {
            Some(render) => self.fetch_rendered(render, url, timeout).await?,
            None => self.fetch_direct(url, timeout).await?,
        };
        Ok(Box::new(HtmlPage::new(url, html)))
    }

    fn name(&self) -> &str {
        if self.render.is_some() {
            "http+render"
        } else {
            "http"
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"<html><body>
        <div class="p-price"><span class="price">  4999.00 </span></div>
        <div class="p-price"><span class="price">1.00</span></div>
        <span class="empty">   </span>
        <img id="spec-img" src="//img.example.com/main.jpg">
    </body></html>"#;

    const T: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn text_of_first_match_is_trimmed() {
        let page = HtmlPage::new("https://item.example.com/1.html", HTML);
        let text = page.query_selector_text(".p-price .price", T).await.unwrap();
        assert_eq!(text.as_deref(), Some("4999.00"));
    }

    #[tokio::test]
    async fn blank_and_missing_elements_are_none() {
        let page = HtmlPage::new("https://item.example.com/1.html", HTML);
        assert_eq!(page.query_selector_text(".empty", T).await.unwrap(), None);
        assert_eq!(page.query_selector_text("#nope", T).await.unwrap(), None);
    }

    #[tokio::test]
    async fn attribute_lookup() {
        let page = HtmlPage::new("https://item.example.com/1.html", HTML);
        let src = page.query_selector_attr("#spec-img", "src", T).await.unwrap();
        assert_eq!(src.as_deref(), Some("//img.example.com/main.jpg"));
    }

    #[tokio::test]
    async fn bad_selector_is_an_error() {
        let page = HtmlPage::new("https://item.example.com/1.html", HTML);
        assert!(page.query_selector_text("div[", T).await.is_err());
    }

    const AUTH: &str = r#"{"cookies": [
        {"name": "thor", "value": "abc", "domain": "127.0.0.1", "path": "/"},
        {"name": "pt_key", "value": "k1", "domain": ".jd.com", "path": "/"}
    ]}"#;

    /// Serves one HTTP request with `body`, returning the raw request text.
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (base, handle)
    }

    fn local_session(render: Option<&str>, token: Option<&str>) -> HttpSession {
        let client = client_builder("pricewatch-test").no_proxy().build().unwrap();
        HttpSession::with_client(client, render, token)
            .with_auth(Some(AuthState::from_json(AUTH).unwrap()))
    }

    #[tokio::test]
    async fn direct_fetch_sends_saved_cookies() {
        let (base, server) = serve_once(HTML).await;
        let session = local_session(None, None);
        let page = session
            .navigate(&format!("{base}/item/1.html"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            page.query_selector_text(".p-price .price", T).await.unwrap().as_deref(),
            Some("4999.00")
        );

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /item/1.html "));
        assert!(request.contains("cookie: thor=abc\r\n"));
        assert!(!request.contains("pt_key"));
    }

    #[tokio::test]
    async fn render_request_carries_cookies_and_encoded_token() {
        let (base, server) = serve_once(HTML).await;
        let session = local_session(Some(&format!("{base}/")), Some("a b&c"));
        let target = "https://item.jd.com/100012043978.html";
        let page = session.navigate(target, Duration::from_secs(5)).await.unwrap();
        assert_eq!(page.url(), target);

        let request = server.await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert_eq!(request_line, "POST /content?token=a+b%26c HTTP/1.1");

        let (_, body) = request.split_once("\r\n\r\n").unwrap();
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["url"], target);
        let cookies = body["cookies"].as_array().unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0]["name"], "pt_key");
        assert_eq!(cookies[0]["domain"], ".jd.com");
    }

    #[test]
    fn only_disconnect_is_session_level() {
        assert!(SessionError::Disconnected("x".into()).is_session_level());
        assert!(!SessionError::Timeout(T).is_session_level());
        assert!(!SessionError::Navigation("x".into()).is_session_level());
    }
}
