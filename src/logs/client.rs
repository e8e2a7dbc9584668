//! Log source backed by the platform's HTTP logs endpoint.

use serde::Deserialize;

use super::{LogEntry, LogPage, LogQuery, LogSource};
use crate::http::{self, HTTP_CLIENT};
use crate::machines::ProviderFuture;

#[derive(Deserialize)]
struct LogsResponse {
    #[serde(default)]
    data: Vec<LogRecord>,
    #[serde(default)]
    meta: LogsMeta,
}

#[derive(Default, Deserialize)]
struct LogsMeta {
    #[serde(default)]
    next_token: String,
}

#[derive(Deserialize)]
struct LogRecord {
    attributes: LogAttributes,
}

#[derive(Deserialize)]
struct LogAttributes {
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    instance: String,
    #[serde(default)]
    region: String,
}

impl From<LogAttributes> for LogEntry {
    fn from(attributes: LogAttributes) -> Self {
        Self {
            timestamp: attributes.timestamp,
            instance: attributes.instance,
            region: attributes.region,
            level: attributes.level,
            message: attributes.message,
        }
    }
}

/// Fetches log pages from `GET /api/v1/apps/{app}/logs`.
#[derive(Clone)]
pub struct FlyLogClient {
    base_url: String,
    authorization: String,
}

impl std::fmt::Debug for FlyLogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlyLogClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl FlyLogClient {
    /// Creates a client for `base_url` authenticating with `token`.
    #[must_use]
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            authorization: http::authorization_value(token),
        }
    }
}

impl LogSource for FlyLogClient {
    fn fetch_page<'a>(
        &'a self,
        query: &'a LogQuery,
        token: &'a str,
    ) -> ProviderFuture<'a, LogPage> {
        Box::pin(async move {
            let url = format!("{}/api/v1/apps/{}/logs", self.base_url, query.app);
            let mut params: Vec<(&str, &str)> = Vec::with_capacity(3);
            for (key, value) in [
                ("next_token", token),
                ("region", query.region.as_str()),
                ("instance", query.machine_id.as_str()),
            ] {
                if !value.is_empty() {
                    params.push((key, value));
                }
            }
            let request = HTTP_CLIENT.get(url).query(&params);
            let body = http::send_expecting_success(request, &self.authorization).await?;
            let parsed: LogsResponse = http::decode("log page", &body)?;
            Ok(LogPage {
                entries: parsed
                    .data
                    .into_iter()
                    .map(|record| LogEntry::from(record.attributes))
                    .collect(),
                next_token: parsed.meta.next_token,
            })
        })
    }
}
