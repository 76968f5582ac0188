//! REST client for the Jiandaoyun form API.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sync_config::shared::SinkConfig;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::sink::{Condition, ExternalEntity, Sink};
use crate::sync_error;
use crate::types::Payload;

/// Maximum number of entities requested per lookup.
const QUERY_LIMIT: u32 = 10;

const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Header carrying a unique id per request, for correlating with server-side logs.
const REQUEST_ID_HEADER: &str = "X-Request-ID";

#[derive(Serialize)]
struct CreateRequest<'a> {
    app_id: &'a str,
    entry_id: &'a str,
    data_list: &'a [Payload],
    is_start_workflow: bool,
}

#[derive(Serialize)]
struct QueryCondition<'a> {
    field: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    method: &'static str,
    value: [&'a str; 1],
}

#[derive(Serialize)]
struct QueryFilter<'a> {
    rel: &'static str,
    cond: Vec<QueryCondition<'a>>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    app_id: &'a str,
    entry_id: &'a str,
    limit: u32,
    filter: QueryFilter<'a>,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    app_id: &'a str,
    entry_id: &'a str,
    data_id: &'a str,
    data: &'a Payload,
    is_start_trigger: bool,
}

/// Client for the create, query and update endpoints of a Jiandaoyun app.
///
/// Every request carries the configured token verbatim in `Authorization` and a fresh
/// `X-Request-ID`. A response counts as successful only when it is a 2xx with a JSON body that
/// reports success (see [`is_success`]).
#[derive(Debug, Clone)]
pub struct JiandaoyunClient {
    client: reqwest::Client,
    create_url: String,
    query_url: String,
    update_url: String,
    api_token: SecretString,
    app_id: String,
    start_workflow: bool,
}

impl JiandaoyunClient {
    pub fn new(config: &SinkConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| {
                sync_error!(
                    ErrorKind::ConfigError,
                    "Failed to build the sink HTTP client",
                    source: err
                )
            })?;

        Ok(Self {
            client,
            create_url: config.create_url.clone(),
            query_url: config.query_url.clone(),
            update_url: config.update_url.clone(),
            api_token: config.api_token.clone(),
            app_id: config.app_id.clone(),
            start_workflow: config.start_workflow,
        })
    }

    /// Posts `body` and returns the parsed JSON response of a 2xx reply.
    async fn post<B: Serialize>(&self, url: &str, body: &B) -> SyncResult<JsonValue> {
        let request_id = Uuid::new_v4().to_string();

        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, self.api_token.expose_secret())
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(REQUEST_ID_HEADER, &request_id)
            .body(serde_json::to_vec(body)?)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        debug!(%url, %request_id, status = status.as_u16(), "sink responded");

        if !status.is_success() {
            bail!(
                ErrorKind::SinkRequestFailed,
                "Sink returned an error status",
                format!("{status}: {}", truncate_body(&text))
            );
        }

        if text.trim().is_empty() {
            bail!(
                ErrorKind::SinkResponseInvalid,
                "Sink returned an empty response",
                request_id
            );
        }

        serde_json::from_str(&text).map_err(|err| {
            sync_error!(
                ErrorKind::SinkResponseInvalid,
                "Sink returned an unparseable response",
                truncate_body(&text),
                source: err
            )
        })
    }
}

impl Sink for JiandaoyunClient {
    fn name() -> &'static str {
        "jiandaoyun"
    }

    async fn create(&self, entry_id: &str, records: &[Payload]) -> SyncResult<()> {
        let body = CreateRequest {
            app_id: &self.app_id,
            entry_id,
            data_list: records,
            is_start_workflow: self.start_workflow,
        };

        let response = self.post(&self.create_url, &body).await?;
        if !is_success(&response) {
            bail!(
                ErrorKind::SinkRejected,
                "Sink rejected the create request",
                format!("{} records: {response}", records.len())
            );
        }

        Ok(())
    }

    async fn query_by_fields(
        &self,
        entry_id: &str,
        conditions: &[Condition],
    ) -> SyncResult<Option<ExternalEntity>> {
        let body = QueryRequest {
            app_id: &self.app_id,
            entry_id,
            limit: QUERY_LIMIT,
            filter: QueryFilter {
                rel: "and",
                cond: conditions
                    .iter()
                    .map(|condition| QueryCondition {
                        field: &condition.field,
                        kind: "text",
                        method: "eq",
                        value: [condition.value.as_str()],
                    })
                    .collect(),
            },
        };

        let response = self.post(&self.query_url, &body).await?;
        let Some(data) = response.get("data").and_then(JsonValue::as_array) else {
            bail!(
                ErrorKind::SinkResponseInvalid,
                "Sink query response has no data array",
                response
            );
        };

        let mut entities = Vec::with_capacity(data.len());
        for entry in data {
            let Some(object) = entry.as_object() else {
                warn!(entry_id, "skipping non-object entry in sink query response");
                continue;
            };
            let Some(id) = object.get("_id").and_then(JsonValue::as_str) else {
                warn!(entry_id, "skipping sink query entry without _id");
                continue;
            };

            entities.push(ExternalEntity {
                id: id.to_string(),
                fields: object
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect::<BTreeMap<_, _>>(),
            });
        }

        // The API matches loosely; every condition is checked again here.
        Ok(entities
            .into_iter()
            .find(|entity| entity.matches(conditions)))
    }

    async fn update(&self, entry_id: &str, external_id: &str, fields: &Payload) -> SyncResult<()> {
        let body = UpdateRequest {
            app_id: &self.app_id,
            entry_id,
            data_id: external_id,
            data: fields,
            is_start_trigger: true,
        };

        let response = self.post(&self.update_url, &body).await?;
        if !is_success(&response) {
            bail!(
                ErrorKind::SinkRejected,
                "Sink rejected the update request",
                format!("{external_id}: {response}")
            );
        }

        Ok(())
    }
}

/// Returns `true` for a response reporting success: a `status` of `"success"`, a non-null
/// `data`, or a `dataId`/`data_id` key.
pub fn is_success(response: &JsonValue) -> bool {
    let Some(object) = response.as_object() else {
        return false;
    };

    if object.get("status").and_then(JsonValue::as_str) == Some("success") {
        return true;
    }

    if object.get("data").is_some_and(|data| !data.is_null()) {
        return true;
    }

    object.contains_key("dataId") || object.contains_key("data_id")
}

fn truncate_body(body: &str) -> String {
    const MAX_BODY_LENGTH: usize = 200;

    body.chars().take(MAX_BODY_LENGTH).collect()
}
