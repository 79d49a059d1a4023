//! Snow report scraper
//!
//! Fetches the resort snow report page and extracts the lift table. The page
//! layout is owned by the resort, so a missing table is reported and
//! treated as "no lifts" instead of an error.

use super::{SourceError, StatusMap, StatusSource};
use crate::notify::LocalLog;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};

/// Desktop browser identities rotated between requests
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/89.0.4389.82 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:86.0) Gecko/20100101 Firefox/86.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/89.0.4389.82 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Safari/605.1.15",
];

const ACCEPT_VALUE: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";
const ACCEPT_LANGUAGE_VALUE: &str = "en-US,en;q=0.9";

const MISSING_TABLE: &str =
    "Error: Unable to find the lift status section. The structure of the webpage might have changed.";

/// Compiled selectors describing where the lift table lives
pub struct PageLayout {
    container: Selector,
    row: Selector,
    name: Selector,
    column: Selector,
}

impl PageLayout {
    pub fn snow_report() -> Result<Self, SourceError> {
        Ok(Self {
            container: selector("#lift-status")?,
            row: selector(".rose-data.pad-12.row.b-border")?,
            name: selector(".rose-name")?,
            column: selector(".column")?,
        })
    }

    /// `None` when the lift table is absent from the document
    pub fn extract(&self, html: &str) -> Option<StatusMap> {
        let document = Html::parse_document(html);
        let container = document.select(&self.container).next()?;

        let mut statuses = StatusMap::new();
        for row in container.select(&self.row) {
            match self.extract_row(row) {
                Some((name, status)) => statuses.insert(name, status),
                None => debug!("Skipping malformed lift row"),
            }
        }
        Some(statuses)
    }

    fn extract_row(&self, row: ElementRef<'_>) -> Option<(String, String)> {
        let name = element_text(row.select(&self.name).next()?);
        if name.is_empty() {
            return None;
        }

        let status = row
            .select(&self.column)
            .next()?
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|sibling| sibling.value().name() == "div")
            .map(element_text)?;

        Some((name, status))
    }
}

/// Parse a snow report document with the default layout
pub fn parse_status_page(html: &str) -> Result<Option<StatusMap>, SourceError> {
    Ok(PageLayout::snow_report()?.extract(html))
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css)
        .map_err(|e| SourceError::Unavailable(format!("invalid selector `{css}`: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// HTTP status source for the resort snow report
pub struct SnowReportSource {
    client: reqwest::Client,
    url: String,
    layout: PageLayout,
    diagnostics: Option<LocalLog>,
}

impl SnowReportSource {
    /// `diagnostics` receives a line whenever the lift table goes missing
    pub fn new(url: impl Into<String>, diagnostics: Option<LocalLog>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            layout: PageLayout::snow_report()?,
            diagnostics,
        })
    }

    async fn download(&self) -> Result<String, SourceError> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        let response = self
            .client
            .get(&self.url)
            .header(USER_AGENT, user_agent)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGE_VALUE)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                status: response.status(),
            });
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl StatusSource for SnowReportSource {
    async fn fetch(&mut self) -> Result<StatusMap, SourceError> {
        let body = self.download().await?;

        match self.layout.extract(&body) {
            Some(statuses) => {
                debug!("Fetched {} lift statuses from {}", statuses.len(), self.url);
                Ok(statuses)
            }
            None => {
                warn!("{}", MISSING_TABLE);
                if let Some(log) = &self.diagnostics {
                    if let Err(e) = log.append(MISSING_TABLE).await {
                        warn!("Failed to record missing lift table in local log: {}", e);
                    }
                }
                Ok(StatusMap::new())
            }
        }
    }
}
