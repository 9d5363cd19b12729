//! Firestore REST v1 remote.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use shopsync_common::{timestamp_from_millis, Entity, Error, Payload, Result};

use super::codec::{decode_value, encode_value};
use crate::provider::{RemoteDocument, RemoteStore};
use crate::session::{FirebaseConfig, RemoteSession};

/// Wait applied when a rate-limit response carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_MS: u64 = 30_000;

/// Documents fetched per `runQuery` page.
const PAGE_SIZE: usize = 300;

const FIELD_DATA: &str = "data";
const FIELD_UPDATED_AT: &str = "updatedAt";
const FIELD_DELETED: &str = "deleted";
const FIELD_SYNCED_AT: &str = "syncedAt";

/// Firestore document resource as returned by the API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirestoreDocument {
    /// Full resource name, ending in the document id.
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
    update_time: String,
}

impl FirestoreDocument {
    fn into_remote(self) -> Result<RemoteDocument> {
        let id = self
            .name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let payload = match self.fields.get(FIELD_DATA).map(decode_value).transpose()? {
            Some(Value::Object(map)) => map,
            _ => Payload::new(),
        };

        let update_time = parse_time(&self.update_time, "updateTime")?;

        let updated_at = match self
            .fields
            .get(FIELD_UPDATED_AT)
            .map(decode_value)
            .transpose()?
            .and_then(|v| v.as_i64())
        {
            Some(millis) => timestamp_from_millis(millis)?,
            None => update_time,
        };

        // Written before the field existed: the commit time is the closest match.
        let synced_at = match self.fields.get(FIELD_SYNCED_AT).map(decode_value).transpose()? {
            Some(Value::String(raw)) => parse_time(&raw, FIELD_SYNCED_AT)?,
            _ => update_time,
        };

        let deleted = self
            .fields
            .get(FIELD_DELETED)
            .map(decode_value)
            .transpose()?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(RemoteDocument {
            id,
            payload,
            updated_at,
            synced_at,
            version: self.update_time,
            deleted,
        })
    }
}

/// One element of a `runQuery` response stream.
#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<FirestoreDocument>,
}

/// Reply to a `commit` call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    #[serde(default)]
    write_results: Vec<WriteResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResult {
    #[serde(default)]
    update_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// Write precondition on the current document.
#[derive(Debug, Clone, Copy)]
enum Precondition<'a> {
    Missing,
    UpdatedAt(&'a str),
}

impl Precondition<'_> {
    fn to_json(self) -> Value {
        match self {
            Precondition::Missing => json!({ "exists": false }),
            Precondition::UpdatedAt(time) => json!({ "updateTime": time }),
        }
    }
}

/// Remote store backed by Firestore.
///
/// Documents live at `tenants/{tenantId}/{entity}/{id}` with the business
/// payload under `data`, the writer's timestamp under `updatedAt` (epoch ms)
/// and a `deleted` flag for tombstones. Every write also sets `syncedAt` to
/// the server's request time, which pulls page on. The document `updateTime`
/// serves as the version token.
pub struct FirestoreRemote {
    http: Client,
}

impl FirestoreRemote {
    /// Create a client.
    ///
    /// # Errors
    /// - `Network` if the HTTP client cannot be built
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("shopsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    async fn fetch(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
    ) -> Result<Option<RemoteDocument>> {
        let config = session.require_firebase()?;
        let token = session.require_token()?;
        let url = document_url(config, entity, id)?;

        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose())
            .query(&[("key", config.api_key.as_str())])
            .send()
            .await
            .map_err(|e| transport_error("get document", e))?;

        match handle_response::<FirestoreDocument>(response).await {
            Ok(doc) => doc.into_remote().map(Some),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Commit one document write, stamping `syncedAt` server side.
    /// Returns the new version.
    async fn write(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        fields: Map<String, Value>,
        mask: &[&str],
        precondition: Precondition<'_>,
    ) -> Result<String> {
        let config = session.require_firebase()?;
        let token = session.require_token()?;
        let url = commit_url(config)?;
        let body = commit_body(document_name(config, entity, id), fields, mask, precondition);

        debug!("firestore: commit {}/{} ({:?})", entity, id, precondition);
        let response = self
            .http
            .post(url)
            .bearer_auth(token.expose())
            .query(&[("key", config.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("write document", e))?;

        let committed: CommitResponse = handle_response(response).await?;
        committed
            .write_results
            .into_iter()
            .next()
            .and_then(|result| result.update_time)
            .ok_or_else(|| {
                Error::Network(format!("Commit of {}/{} returned no update time", entity, id))
            })
    }

    /// Current live version, or `NotFound`.
    async fn live_version(&self, session: &RemoteSession, entity: Entity, id: &str) -> Result<String> {
        match self.fetch(session, entity, id).await? {
            Some(doc) if !doc.deleted => Ok(doc.version),
            _ => Err(Error::NotFound(format!("{}/{}", entity, id))),
        }
    }
}

#[async_trait]
impl RemoteStore for FirestoreRemote {
    fn name(&self) -> &str {
        "firestore"
    }

    async fn create(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        payload: &Payload,
        updated_at: DateTime<Utc>,
    ) -> Result<String> {
        let fields = document_fields(Some(payload), updated_at);
        match self
            .write(session, entity, id, fields.clone(), &[], Precondition::Missing)
            .await
        {
            Err(Error::Conflict(_)) => match self.fetch(session, entity, id).await? {
                // A tombstone counts as absent.
                Some(doc) if doc.deleted => {
                    self.write(
                        session,
                        entity,
                        id,
                        fields,
                        &[],
                        Precondition::UpdatedAt(&doc.version),
                    )
                    .await
                }
                _ => Err(Error::Conflict(format!("{}/{} already exists", entity, id))),
            },
            other => other,
        }
    }

    async fn update(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        payload: &Payload,
        updated_at: DateTime<Utc>,
        expected_version: Option<&str>,
    ) -> Result<String> {
        let fields = document_fields(Some(payload), updated_at);
        match expected_version {
            Some(expected) => {
                self.write(session, entity, id, fields, &[], Precondition::UpdatedAt(expected))
                    .await
            }
            None => {
                let current = self.live_version(session, entity, id).await?;
                self.write(session, entity, id, fields, &[], Precondition::UpdatedAt(&current))
                    .await
            }
        }
    }

    async fn delete(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
        updated_at: DateTime<Utc>,
        expected_version: Option<&str>,
    ) -> Result<String> {
        let fields = document_fields(None, updated_at);
        let mask = [FIELD_UPDATED_AT, FIELD_DELETED];
        match expected_version {
            Some(expected) => {
                self.write(session, entity, id, fields, &mask, Precondition::UpdatedAt(expected))
                    .await
            }
            None => {
                let current = self.live_version(session, entity, id).await?;
                self.write(session, entity, id, fields, &mask, Precondition::UpdatedAt(&current))
                    .await
            }
        }
    }

    async fn get(
        &self,
        session: &RemoteSession,
        entity: Entity,
        id: &str,
    ) -> Result<Option<RemoteDocument>> {
        self.fetch(session, entity, id).await
    }

    async fn changed_since(
        &self,
        session: &RemoteSession,
        entity: Entity,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteDocument>> {
        let config = session.require_firebase()?;
        let token = session.require_token()?;
        let url = run_query_url(config)?;

        let mut documents = Vec::new();
        let mut start_after: Option<(DateTime<Utc>, String)> = None;

        loop {
            let query = changed_since_query(entity, cursor, start_after.as_ref());
            let response = self
                .http
                .post(url.clone())
                .bearer_auth(token.expose())
                .query(&[("key", config.api_key.as_str())])
                .json(&json!({ "structuredQuery": query }))
                .send()
                .await
                .map_err(|e| transport_error("query documents", e))?;

            let items: Vec<RunQueryItem> = handle_response(response).await?;
            let page: Vec<FirestoreDocument> = items.into_iter().filter_map(|i| i.document).collect();
            let full_page = page.len() >= PAGE_SIZE;

            for doc in page {
                let name = doc.name.clone();
                let remote = doc.into_remote()?;
                start_after = Some((remote.synced_at, name));
                documents.push(remote);
            }

            if !full_page {
                break;
            }
        }

        debug!(
            "firestore: {} changed {} document(s) since {:?}",
            entity,
            documents.len(),
            cursor
        );
        Ok(documents)
    }
}

fn document_fields(payload: Option<&Payload>, updated_at: DateTime<Utc>) -> Map<String, Value> {
    let mut fields = Map::new();
    if let Some(payload) = payload {
        fields.insert(
            FIELD_DATA.to_string(),
            encode_value(&Value::Object(payload.clone())),
        );
    }
    fields.insert(
        FIELD_UPDATED_AT.to_string(),
        encode_value(&Value::from(updated_at.timestamp_millis())),
    );
    fields.insert(
        FIELD_DELETED.to_string(),
        encode_value(&Value::Bool(payload.is_none())),
    );
    fields
}

fn commit_body(
    name: String,
    fields: Map<String, Value>,
    mask: &[&str],
    precondition: Precondition<'_>,
) -> Value {
    let mut write = json!({
        "update": { "name": name, "fields": fields },
        "updateTransforms": [
            { "fieldPath": FIELD_SYNCED_AT, "setToServerValue": "REQUEST_TIME" }
        ],
        "currentDocument": precondition.to_json()
    });
    if !mask.is_empty() {
        write["updateMask"] = json!({ "fieldPaths": mask });
    }
    json!({ "writes": [write] })
}

fn timestamp_value(time: &DateTime<Utc>) -> Value {
    json!({ "timestampValue": time.to_rfc3339_opts(SecondsFormat::Micros, true) })
}

fn parse_time(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("Bad {}: {}", field, e)))
}

fn changed_since_query(
    entity: Entity,
    cursor: Option<DateTime<Utc>>,
    start_after: Option<&(DateTime<Utc>, String)>,
) -> Value {
    let mut query = json!({
        "from": [{ "collectionId": entity.as_str() }],
        "orderBy": [
            { "field": { "fieldPath": FIELD_SYNCED_AT }, "direction": "ASCENDING" },
            { "field": { "fieldPath": "__name__" }, "direction": "ASCENDING" }
        ],
        "limit": PAGE_SIZE
    });

    if let Some(cursor) = cursor {
        query["where"] = json!({
            "fieldFilter": {
                "field": { "fieldPath": FIELD_SYNCED_AT },
                "op": "GREATER_THAN_OR_EQUAL",
                "value": timestamp_value(&cursor)
            }
        });
    }

    if let Some((synced_at, name)) = start_after {
        query["startAt"] = json!({
            "values": [
                timestamp_value(synced_at),
                { "referenceValue": name }
            ],
            "before": false
        });
    }

    query
}

fn database_url(config: &FirebaseConfig, tail: &[&str]) -> Result<Url> {
    config.validate()?;
    let invalid = || Error::InvalidInput(format!("Invalid Firestore URL: {}", config.base_url));

    let mut url = Url::parse(&config.base_url).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend([
            "projects",
            config.project_id.as_str(),
            "databases",
            config.database_id.as_str(),
        ])
        .extend(tail);
    Ok(url)
}

fn document_url(config: &FirebaseConfig, entity: Entity, id: &str) -> Result<Url> {
    database_url(
        config,
        &["documents", "tenants", config.tenant_id.as_str(), entity.as_str(), id],
    )
}

fn run_query_url(config: &FirebaseConfig) -> Result<Url> {
    let parent = format!("{}:runQuery", config.tenant_id);
    database_url(config, &["documents", "tenants", parent.as_str()])
}

fn commit_url(config: &FirebaseConfig) -> Result<Url> {
    database_url(config, &["documents:commit"])
}

/// Resource name used inside write requests.
fn document_name(config: &FirebaseConfig, entity: Entity, id: &str) -> String {
    format!(
        "projects/{}/databases/{}/documents/tenants/{}/{}/{}",
        config.project_id, config.database_id, config.tenant_id, entity, id
    )
}

fn transport_error(action: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Network(format!("Timed out trying to {}", action))
    } else {
        Error::Network(format!("Failed to {}: {}", action, err))
    }
}

fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1000))
}

/// Map an error response onto the remote error taxonomy.
fn map_error(status: StatusCode, retry_after_ms: Option<u64>, body: &str) -> Error {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_default();
    let message = if detail.message.is_empty() {
        format!("HTTP {}", status)
    } else {
        detail.message
    };

    if status == StatusCode::TOO_MANY_REQUESTS || detail.status == "RESOURCE_EXHAUSTED" {
        return Error::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS),
        };
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Authentication(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Error::Conflict(message),
        _ if detail.status == "FAILED_PRECONDITION" || detail.status == "ALREADY_EXISTS" => {
            Error::Conflict(message)
        }
        _ => Error::Network(format!("API error: {} - {}", status, message)),
    }
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();

    if status.is_success() {
        response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    } else {
        let retry_after = retry_after_ms(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(map_error(status, retry_after, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn config() -> FirebaseConfig {
        FirebaseConfig::new("api-key", "shop-prod", "acme")
    }

    #[test]
    fn test_document_url_layout() {
        let url = document_url(&config(), Entity::Orders, "o 1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://firestore.googleapis.com/v1/projects/shop-prod/databases/(default)/documents/tenants/acme/orders/o%201"
        );

        let url = run_query_url(&config()).unwrap();
        assert!(url.as_str().ends_with("/documents/tenants/acme:runQuery"));

        let url = commit_url(&config()).unwrap();
        assert!(url.as_str().ends_with("/databases/(default)/documents:commit"));
        assert_eq!(
            document_name(&config(), Entity::Orders, "o1"),
            "projects/shop-prod/databases/(default)/documents/tenants/acme/orders/o1"
        );
    }

    #[test]
    fn test_commit_stamps_server_time() {
        let fields = document_fields(None, Utc::now());
        let body = commit_body(
            "projects/p/databases/d/documents/tenants/t/products/p1".to_string(),
            fields,
            &[FIELD_UPDATED_AT, FIELD_DELETED],
            Precondition::UpdatedAt("2024-05-01T10:00:00.123456Z"),
        );

        let write = &body["writes"][0];
        assert_eq!(
            write["updateTransforms"][0],
            json!({"fieldPath": "syncedAt", "setToServerValue": "REQUEST_TIME"})
        );
        assert_eq!(write["currentDocument"]["updateTime"], "2024-05-01T10:00:00.123456Z");
        assert_eq!(write["updateMask"]["fieldPaths"], json!(["updatedAt", "deleted"]));

        let create = commit_body(
            "projects/p/databases/d/documents/tenants/t/products/p2".to_string(),
            Map::new(),
            &[],
            Precondition::Missing,
        );
        assert_eq!(create["writes"][0]["currentDocument"], json!({"exists": false}));
        assert!(create["writes"][0].get("updateMask").is_none());
    }

    #[test]
    fn test_parse_document() {
        let doc: FirestoreDocument = serde_json::from_value(json!({
            "name": "projects/p/databases/(default)/documents/tenants/acme/products/p1",
            "fields": {
                "data": { "mapValue": { "fields": { "stock": { "integerValue": "3" } } } },
                "updatedAt": { "integerValue": "1714557600000" },
                "syncedAt": { "timestampValue": "2024-05-01T10:00:00.120000Z" },
                "deleted": { "booleanValue": false }
            },
            "createTime": "2024-05-01T10:00:00.000000Z",
            "updateTime": "2024-05-01T10:00:00.123456Z"
        }))
        .unwrap();

        let remote = doc.into_remote().unwrap();
        assert_eq!(remote.id, "p1");
        assert_eq!(remote.payload["stock"], 3);
        assert_eq!(remote.updated_at.timestamp_millis(), 1_714_557_600_000);
        assert_eq!(remote.synced_at.timestamp_millis(), 1_714_557_600_120);
        assert_eq!(remote.version, "2024-05-01T10:00:00.123456Z");
        assert!(!remote.deleted);
    }

    #[test]
    fn test_tombstone_fields() {
        let fields = document_fields(None, Utc::now());
        assert!(!fields.contains_key(FIELD_DATA));
        assert_eq!(fields[FIELD_DELETED], json!({"booleanValue": true}));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_error(StatusCode::TOO_MANY_REQUESTS, Some(5000), ""),
            Error::RateLimited { retry_after_ms: 5000 }
        ));
        assert!(matches!(
            map_error(StatusCode::TOO_MANY_REQUESTS, None, ""),
            Error::RateLimited { retry_after_ms: DEFAULT_RETRY_AFTER_MS }
        ));
        assert!(matches!(
            map_error(StatusCode::UNAUTHORIZED, None, ""),
            Error::Authentication(_)
        ));
        assert!(matches!(
            map_error(StatusCode::NOT_FOUND, None, ""),
            Error::NotFound(_)
        ));

        let precondition = r#"{"error": {"code": 400, "message": "stale", "status": "FAILED_PRECONDITION"}}"#;
        assert!(matches!(
            map_error(StatusCode::BAD_REQUEST, None, precondition),
            Error::Conflict(_)
        ));
        assert!(matches!(
            map_error(StatusCode::SERVICE_UNAVAILABLE, None, "down"),
            Error::Network(_)
        ));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_ms(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_ms(&headers), Some(7000));
    }

    #[test]
    fn test_query_paging_cursor() {
        let cursor = timestamp_from_millis(1_000).unwrap();
        let start = (
            timestamp_from_millis(2_000).unwrap(),
            "projects/p/databases/d/documents/tenants/t/products/x".to_string(),
        );
        let query = changed_since_query(Entity::Products, Some(cursor), Some(&start));

        assert_eq!(query["orderBy"][0]["field"]["fieldPath"], "syncedAt");
        assert_eq!(query["where"]["fieldFilter"]["field"]["fieldPath"], "syncedAt");
        assert_eq!(
            query["where"]["fieldFilter"]["value"]["timestampValue"],
            "1970-01-01T00:00:01.000000Z"
        );
        assert_eq!(
            query["startAt"]["values"][0]["timestampValue"],
            "1970-01-01T00:00:02.000000Z"
        );
        assert_eq!(query["startAt"]["before"], false);
    }
}
