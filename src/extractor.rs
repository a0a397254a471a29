use regex::Regex;
use scraper::{Html, Selector};

use crate::error::{ExtractError, HarvestError};

/// Pulls the content region out of an archive page and renders it as Markdown.
///
/// The region is the first element matching a configurable CSS selector, so a
/// layout change upstream is a settings change rather than a code change.
pub struct ContentExtractor {
    selector: Selector,
    selector_src: String,
    trailing_ws: Regex,
    blank_runs: Regex,
}

impl ContentExtractor {
    pub fn new(selector: &str) -> Result<Self, HarvestError> {
        let parsed = Selector::parse(selector).map_err(|e| {
            HarvestError::Config(format!("invalid content selector {:?}: {}", selector, e))
        })?;
        Ok(Self {
            selector: parsed,
            selector_src: selector.to_string(),
            trailing_ws: Regex::new(r"[ \t]+\n").map_err(|e| HarvestError::Config(e.to_string()))?,
            blank_runs: Regex::new(r"\n{3,}").map_err(|e| HarvestError::Config(e.to_string()))?,
        })
    }

    pub fn selector(&self) -> &str {
        &self.selector_src
    }

    pub fn extract(&self, raw: &[u8]) -> Result<String, ExtractError> {
        let html = String::from_utf8_lossy(raw);
        let document = Html::parse_document(&html);
        let region = document
            .select(&self.selector)
            .next()
            .ok_or_else(|| ExtractError::NoContentFound {
                selector: self.selector_src.clone(),
            })?;

        let markdown =
            htmd::convert(&region.inner_html()).map_err(|e| ExtractError::Parse(e.to_string()))?;
        Ok(self.normalize(&markdown))
    }

    fn normalize(&self, markdown: &str) -> String {
        let unified = markdown.replace("\r\n", "\n");
        let trimmed = self.trailing_ws.replace_all(&unified, "\n");
        self.blank_runs
            .replace_all(&trimmed, "\n\n")
            .trim()
            .to_string()
    }
}
