//! Source plugins that discover candidate proxy endpoints.
//!
//! Every upstream is reached through the same [`SourcePlugin`] capability.
//! Which plugins run is static configuration: a list of [`SourceSpec`]s
//! turned into plugin instances once at startup.

use crate::error::{ConfigError, SourceError};
use crate::utils;

use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// A single upstream list of proxies.
///
/// Implementations keep no state between calls and report an unreachable
/// upstream as an error instead of blocking or panicking.
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Fetch raw `host:port` endpoints.
    async fn fetch(&self, timeout: Duration) -> Result<Vec<String>, SourceError>;
}

/// Static description of an enabled source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    /// Plain text lists, one endpoint per line, from URLs or file paths.
    PlainList { name: String, locations: Vec<String> },
    /// JSON document holding an array of `{ip, port}` objects.
    JsonApi {
        name: String,
        url: String,
        /// Key of the array; empty when the document itself is the array.
        list_key: String,
        ip_field: String,
        port_field: String,
        /// Items whose field is `false` are skipped.
        alive_field: Option<String>,
    },
    /// Page scraped with a regex capturing host and port.
    HtmlRegex { name: String, url: String, pattern: String },
    /// Fixed endpoints.
    Static { name: String, endpoints: Vec<String> },
}

impl SourceSpec {
    pub fn name(&self) -> &str {
        match self {
            SourceSpec::PlainList { name, .. }
            | SourceSpec::JsonApi { name, .. }
            | SourceSpec::HtmlRegex { name, .. }
            | SourceSpec::Static { name, .. } => name,
        }
    }

    /// Plain-text list source from a single URL or path.
    pub fn plain(name: impl Into<String>, location: impl Into<String>) -> Self {
        SourceSpec::PlainList {
            name: name.into(),
            locations: vec![location.into()],
        }
    }

    /// Build the plugin instance for this spec.
    pub fn build(&self) -> Result<Arc<dyn SourcePlugin>, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSource {
            name: self.name().to_string(),
            reason: reason.to_string(),
        };

        let plugin: Arc<dyn SourcePlugin> = match self {
            SourceSpec::PlainList { name, locations } => {
                if locations.is_empty() {
                    return Err(invalid("no locations"));
                }
                Arc::new(PlainListSource {
                    name: name.clone(),
                    locations: locations.clone(),
                })
            }
            SourceSpec::JsonApi {
                name,
                url,
                list_key,
                ip_field,
                port_field,
                alive_field,
            } => Arc::new(JsonApiSource {
                name: name.clone(),
                url: url.clone(),
                layout: JsonLayout {
                    list_key: list_key.clone(),
                    ip_field: ip_field.clone(),
                    port_field: port_field.clone(),
                    alive_field: alive_field.clone(),
                },
            }),
            SourceSpec::HtmlRegex { name, url, pattern } => {
                let pattern = Regex::new(pattern).map_err(|e| invalid(&e.to_string()))?;
                if pattern.captures_len() < 3 {
                    return Err(invalid("pattern needs host and port capture groups"));
                }
                Arc::new(HtmlRegexSource {
                    name: name.clone(),
                    url: url.clone(),
                    pattern,
                })
            }
            SourceSpec::Static { name, endpoints } => Arc::new(StaticSource::new(name.clone(), endpoints.clone())),
        };
        Ok(plugin)
    }
}

/// The stock set of public free-proxy lists.
pub fn builtin_sources() -> Vec<SourceSpec> {
    vec![
        SourceSpec::plain(
            "thespeedx",
            "https://raw.githubusercontent.com/TheSpeedX/SOCKS-List/master/http.txt",
        ),
        SourceSpec::JsonApi {
            name: "proxyscrape".to_string(),
            url: "https://api.proxyscrape.com/v4/free-proxy-list/get?request=get_proxies&skip=0&proxy_format=protocolipport&format=json&limit=500".to_string(),
            list_key: "proxies".to_string(),
            ip_field: "ip".to_string(),
            port_field: "port".to_string(),
            alive_field: Some("alive".to_string()),
        },
        SourceSpec::JsonApi {
            name: "geonode".to_string(),
            url: "https://proxylist.geonode.com/api/proxy-list?limit=200&page=1&sort_by=lastChecked&sort_type=desc".to_string(),
            list_key: "data".to_string(),
            ip_field: "ip".to_string(),
            port_field: "port".to_string(),
            alive_field: None,
        },
        SourceSpec::HtmlRegex {
            name: "free-proxy-list".to_string(),
            url: "https://free-proxy-list.net/".to_string(),
            pattern: r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})</td><td>(\d+)".to_string(),
        },
        SourceSpec::PlainList {
            name: "proxy-list-download".to_string(),
            locations: vec![
                "https://www.proxy-list.download/api/v1/get?type=http".to_string(),
                "https://www.proxy-list.download/api/v1/get?type=https".to_string(),
            ],
        },
        SourceSpec::plain(
            "sunny9577",
            "https://raw.githubusercontent.com/sunny9577/proxy-scraper/master/proxies.txt",
        ),
        SourceSpec::plain(
            "clarketm",
            "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt",
        ),
    ]
}

fn http_client(timeout: Duration) -> Result<Client, SourceError> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(BROWSER_USER_AGENT)
        .build()?)
}

/// Text lists from one or more locations.
pub struct PlainListSource {
    name: String,
    locations: Vec<String>,
}

#[async_trait]
impl SourcePlugin for PlainListSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, timeout: Duration) -> Result<Vec<String>, SourceError> {
        let client = http_client(timeout)?;
        let mut endpoints = Vec::new();
        let mut last_error = None;

        for location in &self.locations {
            match utils::read_location(&client, location).await {
                Ok(content) => {
                    let parsed = utils::parse_proxy_list(&content);
                    debug!("[{}] {} endpoints from {}", self.name, parsed.len(), location);
                    endpoints.extend(parsed);
                }
                Err(e) => {
                    warn!("[{}] failed to read {}: {}", self.name, location, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if endpoints.is_empty() => Err(e),
            _ => Ok(endpoints),
        }
    }
}

#[derive(Debug, Clone)]
struct JsonLayout {
    list_key: String,
    ip_field: String,
    port_field: String,
    alive_field: Option<String>,
}

/// Endpoints from a JSON document laid out as described.
fn extract_json_endpoints(document: &Value, layout: &JsonLayout) -> Result<Vec<String>, SourceError> {
    let list = if layout.list_key.is_empty() {
        document
    } else {
        document
            .get(&layout.list_key)
            .ok_or_else(|| SourceError::Parse(format!("missing key `{}`", layout.list_key)))?
    };
    let items = list
        .as_array()
        .ok_or_else(|| SourceError::Parse(format!("`{}` is not an array", layout.list_key)))?;

    let endpoints = items
        .iter()
        .filter(|item| match &layout.alive_field {
            Some(field) => item.get(field).and_then(Value::as_bool).unwrap_or(false),
            None => true,
        })
        .filter_map(|item| {
            let ip = item.get(&layout.ip_field)?.as_str()?;
            let port = match item.get(&layout.port_field)? {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => return None,
            };
            utils::normalize_endpoint(&format!("{}:{}", ip, port))
        })
        .collect();
    Ok(endpoints)
}

/// JSON API listing proxies.
pub struct JsonApiSource {
    name: String,
    url: String,
    layout: JsonLayout,
}

#[async_trait]
impl SourcePlugin for JsonApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, timeout: Duration) -> Result<Vec<String>, SourceError> {
        let client = http_client(timeout)?;
        let document: Value = client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        extract_json_endpoints(&document, &self.layout)
    }
}

fn extract_regex_endpoints(content: &str, pattern: &Regex) -> Vec<String> {
    pattern
        .captures_iter(content)
        .filter_map(|caps| {
            let host = caps.get(1)?.as_str();
            let port = caps.get(2)?.as_str();
            utils::normalize_endpoint(&format!("{}:{}", host, port))
        })
        .collect()
}

/// HTML page scraped with a two-group regex.
pub struct HtmlRegexSource {
    name: String,
    url: String,
    pattern: Regex,
}

#[async_trait]
impl SourcePlugin for HtmlRegexSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, timeout: Duration) -> Result<Vec<String>, SourceError> {
        let client = http_client(timeout)?;
        let page = utils::read_location(&client, &self.url).await?;
        Ok(extract_regex_endpoints(&page, &self.pattern))
    }
}

/// Fixed list of endpoints.
pub struct StaticSource {
    name: String,
    endpoints: Vec<String>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            name: name.into(),
            endpoints,
        }
    }
}

#[async_trait]
impl SourcePlugin for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _timeout: Duration) -> Result<Vec<String>, SourceError> {
        Ok(self.endpoints.clone())
    }
}

/// Normalise and de-duplicate raw endpoints, keeping first-seen order.
pub(crate) fn dedupe_endpoints<I>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|e| utils::normalize_endpoint(&e))
        .filter(|e| seen.insert(e.clone()))
        .collect()
}
