//! Call locator: pages HubSpot's CRM search for call objects in a window.

use async_trait::async_trait;
use callgrade_types::{CallRecord, DateRange};
use callgrade_utils::clip;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.hubapi.com";
pub const PAGE_SIZE: u32 = 100;

const PROP_RECORDING_URL: &str = "hs_call_recording_url";
const PROP_CREATED: &str = "hs_createdate";
const PROP_TITLE: &str = "hs_call_title";
const UNTITLED: &str = "Sin título";

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("CRM rejected the access token (HTTP 401)")]
    Unauthorized,
    #[error("CRM returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("CRM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed CRM response: {0}")]
    Decode(String),
    #[error("invalid CRM configuration: {0}")]
    Config(String),
}

/// One page of a call search.
#[derive(Debug, Clone, Default)]
pub struct CallPage {
    pub calls: Vec<CallRecord>,
    /// Cursor for the next page, `None` on the last one.
    pub next_after: Option<String>,
}

/// Paged query over CRM call objects.
#[async_trait]
pub trait CallSearch: Send + Sync {
    async fn search_page(&self, range: &DateRange, after: Option<&str>) -> Result<CallPage, CrmError>;
}

/// Collect every call created in `range` that carries a recording URL.
///
/// All pages are accumulated before filtering. A 401 aborts with
/// [`CrmError::Unauthorized`]; any other failure stops paging and keeps
/// what was already collected.
#[instrument(skip(search))]
pub async fn locate_calls(search: &dyn CallSearch, range: &DateRange) -> Result<Vec<CallRecord>, CrmError> {
    let mut all = Vec::new();
    let mut after: Option<String> = None;
    let mut pages = 0usize;

    loop {
        match search.search_page(range, after.as_deref()).await {
            Ok(page) => {
                pages += 1;
                debug!(page = pages, count = page.calls.len(), "received call page");
                all.extend(page.calls);
                match page.next_after {
                    Some(next) => after = Some(next),
                    None => break,
                }
            }
            Err(CrmError::Unauthorized) => return Err(CrmError::Unauthorized),
            Err(e) => {
                warn!(error = %e, pages, kept = all.len(), "call search aborted, keeping partial results");
                break;
            }
        }
    }

    let total = all.len();
    let with_audio: Vec<CallRecord> = all
        .into_iter()
        .filter(|c| c.recording_url().is_some())
        .collect();
    info!(pages, total, with_recording = with_audio.len(), "call search finished");
    Ok(with_audio)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    filter_groups: Vec<FilterGroup>,
    properties: [&'a str; 3],
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct FilterGroup {
    filters: Vec<Filter>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Filter {
    property_name: &'static str,
    operator: &'static str,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<CrmObject>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    after: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrmObject {
    id: String,
    #[serde(default)]
    properties: HashMap<String, Option<String>>,
    created_at: Option<String>,
}

impl CrmObject {
    fn prop(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_deref())
    }

    fn into_record(self) -> Result<CallRecord, CrmError> {
        let created_at = self
            .prop(PROP_CREATED)
            .and_then(parse_crm_timestamp)
            .or_else(|| self.created_at.as_deref().and_then(parse_crm_timestamp))
            .ok_or_else(|| CrmError::Decode(format!("call {} has no usable creation time", self.id)))?;
        let title = self
            .prop(PROP_TITLE)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(UNTITLED)
            .to_string();
        let recording_url = self.prop(PROP_RECORDING_URL).map(str::to_string);
        Ok(CallRecord {
            id: self.id,
            title,
            created_at,
            recording_url,
        })
    }
}

/// HubSpot stores dates either as epoch milliseconds or RFC 3339 strings.
fn parse_crm_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// HubSpot CRM v3 search client for the `calls` object type.
#[derive(Debug, Clone)]
pub struct HubSpotClient {
    base_url: String,
    client: reqwest::Client,
    page_size: u32,
}

impl HubSpotClient {
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, CrmError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", access_token.trim()))
            .map_err(|e| CrmError::Config(format!("invalid access token header: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .user_agent(concat!("callgrade/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            page_size: PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl CallSearch for HubSpotClient {
    async fn search_page(&self, range: &DateRange, after: Option<&str>) -> Result<CallPage, CrmError> {
        let url = format!("{}/crm/v3/objects/calls/search", self.base_url);
        let body = SearchRequest {
            filter_groups: vec![FilterGroup {
                filters: vec![
                    Filter {
                        property_name: PROP_CREATED,
                        operator: "GTE",
                        value: range.start_ms().to_string(),
                    },
                    Filter {
                        property_name: PROP_CREATED,
                        operator: "LTE",
                        value: range.end_ms().to_string(),
                    },
                ],
            }],
            properties: [PROP_RECORDING_URL, PROP_CREATED, PROP_TITLE],
            limit: self.page_size,
            after,
        };

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CrmError::Unauthorized);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CrmError::Status {
                status: status.as_u16(),
                body: clip(&text),
            });
        }

        let text = resp.text().await?;
        let parsed: SearchResponse =
            serde_json::from_str(&text).map_err(|e| CrmError::Decode(e.to_string()))?;

        let mut calls = Vec::with_capacity(parsed.results.len());
        for obj in parsed.results {
            match obj.into_record() {
                Ok(call) => calls.push(call),
                Err(e) => warn!(error = %e, "skipping call object"),
            }
        }
        Ok(CallPage {
            calls,
            next_after: parsed.paging.and_then(|p| p.next).map(|n| n.after),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SEARCH: &str = "/crm/v3/objects/calls/search";

    fn range() -> DateRange {
        DateRange::from_millis(1_700_000_000_000, 1_700_086_399_999).unwrap()
    }

    fn obj(id: &str, url: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "properties": {
                "hs_call_recording_url": url,
                "hs_createdate": "1700000500000",
                "hs_call_title": format!("Llamada {id}"),
            }
        })
    }

    fn page(objs: Vec<serde_json::Value>, next: Option<&str>) -> String {
        let mut body = serde_json::json!({ "total": objs.len(), "results": objs });
        if let Some(after) = next {
            body["paging"] = serde_json::json!({ "next": { "after": after, "link": "x" } });
        }
        body.to_string()
    }

    #[tokio::test]
    async fn follows_cursor_and_concatenates_pages_in_order() {
        let mut server = Server::new_async().await;
        let p1 = server
            .mock("POST", SEARCH)
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::Regex(r#""limit":100\}$"#.into()))
            .with_status(200)
            .with_body(page(vec![obj("1", Some("https://r/1")), obj("2", Some("https://r/2"))], Some("p2")))
            .expect(1)
            .create_async()
            .await;
        let p2 = server
            .mock("POST", SEARCH)
            .match_body(Matcher::PartialJson(serde_json::json!({ "after": "p2" })))
            .with_status(200)
            .with_body(page(vec![obj("3", Some("https://r/3"))], Some("p3")))
            .expect(1)
            .create_async()
            .await;
        let p3 = server
            .mock("POST", SEARCH)
            .match_body(Matcher::PartialJson(serde_json::json!({ "after": "p3" })))
            .with_status(200)
            .with_body(page(vec![obj("4", Some("https://r/4"))], None))
            .expect(1)
            .create_async()
            .await;

        let client = HubSpotClient::new(&server.url(), "tok").unwrap();
        let calls = locate_calls(&client, &range()).await.unwrap();
        let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        p1.assert_async().await;
        p2.assert_async().await;
        p3.assert_async().await;
    }

    #[tokio::test]
    async fn sends_date_filters_and_properties() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("POST", SEARCH)
            .match_body(Matcher::PartialJson(serde_json::json!({
                "filterGroups": [{ "filters": [
                    { "propertyName": "hs_createdate", "operator": "GTE", "value": "1700000000000" },
                    { "propertyName": "hs_createdate", "operator": "LTE", "value": "1700086399999" }
                ]}],
                "properties": ["hs_call_recording_url", "hs_createdate", "hs_call_title"],
                "limit": 100
            })))
            .with_status(200)
            .with_body(page(vec![], None))
            .create_async()
            .await;

        let client = HubSpotClient::new(&server.url(), "tok").unwrap();
        let calls = locate_calls(&client, &range()).await.unwrap();
        assert!(calls.is_empty());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn drops_calls_without_recording() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", SEARCH)
            .with_status(200)
            .with_body(page(
                vec![obj("1", None), obj("2", Some("")), obj("3", Some("https://r/3"))],
                None,
            ))
            .create_async()
            .await;

        let client = HubSpotClient::new(&server.url(), "tok").unwrap();
        let calls = locate_calls(&client, &range()).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "3");
        assert_eq!(calls[0].title, "Llamada 3");
    }

    #[tokio::test]
    async fn unauthorized_is_terminal() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", SEARCH)
            .with_status(401)
            .with_body(r#"{"status":"error","category":"INVALID_AUTHENTICATION"}"#)
            .create_async()
            .await;

        let client = HubSpotClient::new(&server.url(), "bad").unwrap();
        let err = locate_calls(&client, &range()).await.unwrap_err();
        assert!(matches!(err, CrmError::Unauthorized));
    }

    #[tokio::test]
    async fn server_error_keeps_partial_results() {
        let mut server = Server::new_async().await;
        let _p1 = server
            .mock("POST", SEARCH)
            .match_body(Matcher::Regex(r#""limit":100\}$"#.into()))
            .with_status(200)
            .with_body(page(vec![obj("1", Some("https://r/1"))], Some("p2")))
            .create_async()
            .await;
        let _p2 = server
            .mock("POST", SEARCH)
            .match_body(Matcher::PartialJson(serde_json::json!({ "after": "p2" })))
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let client = HubSpotClient::new(&server.url(), "tok").unwrap();
        let calls = locate_calls(&client, &range()).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "1");
    }

    struct CountingSearch {
        pages: Vec<CallPage>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CallSearch for CountingSearch {
        async fn search_page(&self, _range: &DateRange, _after: Option<&str>) -> Result<CallPage, CrmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.get(n).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn empty_first_page_is_not_an_error() {
        let search = CountingSearch {
            pages: vec![CallPage::default()],
            calls: AtomicUsize::new(0),
        };
        let calls = locate_calls(&search, &range()).await.unwrap();
        assert!(calls.is_empty());
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timestamps_accept_millis_and_rfc3339() {
        let a = parse_crm_timestamp("1700000000000").unwrap();
        let b = parse_crm_timestamp("2023-11-14T22:13:20.000Z").unwrap();
        assert_eq!(a, b);
        assert!(parse_crm_timestamp("yesterday").is_none());
    }

    #[test]
    fn falls_back_to_object_created_at() {
        let o: CrmObject = serde_json::from_value(serde_json::json!({
            "id": "9",
            "properties": { "hs_createdate": null, "hs_call_title": "  " },
            "createdAt": "2023-11-14T22:13:20Z"
        }))
        .unwrap();
        let rec = o.into_record().unwrap();
        assert_eq!(rec.title, "Sin título");
        assert_eq!(rec.created_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(rec.recording_url, None);
    }
}
