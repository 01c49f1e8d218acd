//! CouchDB implementation of the strata-query Adapter trait
//!
//! Speaks CouchDB's HTTP API directly. One HTTP client is built per query;
//! acquisition checks that the configured database exists.
//!
//! ## Operations
//!
//! - `create` (document): `POST /{db}`, returns the stored content with `id` and `rev`
//! - `read` (document): `GET /{db}/_all_docs?include_docs=true` plus filter options
//! - `update` (document): `PUT /{db}/{_id}`, the target must exist
//! - `delete` (fields `id`): `GET` then `DELETE /{db}/{id}?rev=...`
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata_query::{document, DatasourceConfig, Dispatcher, QueryRequest, RegistryBuilder};
//!
//! # async fn example() -> strata_query::Result<()> {
//! let mut builder = RegistryBuilder::new();
//! strata_query_couchdb::register(&mut builder)?;
//! let dispatcher = Dispatcher::new(Arc::new(builder.seal()));
//!
//! let config = DatasourceConfig::new()
//!     .with_value("url", "http://localhost:5984")
//!     .with_value("database", "apps");
//! let request = QueryRequest::document("read", document(serde_json::json!({"limit": 10})));
//! let rows = dispatcher.execute("couchdb", &config, request).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use strata_query::{
    Adapter, AdapterError, AdapterResult, Document, FieldDescriptor, FieldType, HandlerTable,
    IntegrationSchema, Operation, OperationSpec, Payload, QueryResult, RegistryBuilder, Result,
    ValidatedConfig,
};
use tracing::debug;

/// Registry name of the CouchDB integration
pub const INTEGRATION: &str = "couchdb";

/// Query options whose values CouchDB expects JSON-encoded
const JSON_OPTIONS: &[&str] = &["key", "keys", "startkey", "endkey", "start_key", "end_key"];

pub fn schema() -> IntegrationSchema {
    IntegrationSchema::new(INTEGRATION)
        .with_friendly_name("CouchDB")
        .with_documentation_url("https://docs.couchdb.org/en/stable/")
        .with_description(
            "Apache CouchDB is an open-source document-oriented NoSQL database, implemented in Erlang.",
        )
        .with_config_field(
            "url",
            FieldDescriptor::required(FieldType::String).with_default("http://localhost:5984"),
        )
        .with_config_field("database", FieldDescriptor::required(FieldType::String))
        .with_config_field("username", FieldDescriptor::optional(FieldType::String))
        .with_config_field("password", FieldDescriptor::optional(FieldType::Password))
        .with_operation(Operation::Create, OperationSpec::document())
        .with_operation(Operation::Read, OperationSpec::document())
        .with_operation(Operation::Update, OperationSpec::document())
        .with_operation(
            Operation::Delete,
            OperationSpec::structured()
                .with_field("id", FieldDescriptor::required(FieldType::String)),
        )
}

/// Register the CouchDB schema and adapter
pub fn register(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register(schema(), CouchDbAdapter::new())?;
    Ok(())
}

/// Error reported by the CouchDB server
#[derive(Debug, thiserror::Error)]
#[error("CouchDB returned {status}: {error}: {reason}")]
pub struct CouchError {
    pub status: u16,
    pub error: String,
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    id: String,
    rev: String,
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    #[serde(default)]
    doc: Option<Value>,
}

/// CouchDB adapter
pub struct CouchDbAdapter {
    timeout: Duration,
}

impl CouchDbAdapter {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }

    /// Per-request timeout of the HTTP client
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for CouchDbAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP client bound to one database
pub struct CouchClient {
    http: reqwest::Client,
    database_url: String,
    credentials: Option<(String, Option<String>)>,
}

impl CouchClient {
    fn request(&self, method: Method, path: Option<&str>) -> RequestBuilder {
        let url = match path {
            Some(path) => format!("{}/{}", self.database_url, path),
            None => self.database_url.clone(),
        };
        let builder = self.http.request(method, url);
        match &self.credentials {
            Some((username, password)) => builder.basic_auth(username, password.as_ref()),
            None => builder,
        }
    }

    async fn fetch(&self, id: &str) -> AdapterResult<Document> {
        let response = self
            .request(Method::GET, Some(&doc_path(id)))
            .send()
            .await
            .map_err(AdapterError::backend)?;
        check(response)
            .await?
            .json()
            .await
            .map_err(AdapterError::backend)
    }
}

/// URL path segment of a document id. Design documents keep their prefix.
fn doc_path(id: &str) -> String {
    match id.strip_prefix("_design/") {
        Some(name) => format!("_design/{}", urlencoding::encode(name)),
        None => urlencoding::encode(id).into_owned(),
    }
}

fn query_value(name: &str, value: &Value) -> String {
    if JSON_OPTIONS.contains(&name) {
        return value.to_string();
    }
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Map non-success responses: 404 becomes not-found, the rest keep CouchDB's error body
async fn check(response: Response) -> AdapterResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: ErrorBody = response.json().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(AdapterError::not_found(format!(
            "{}: {}",
            body.error, body.reason
        )));
    }

    Err(AdapterError::backend(CouchError {
        status: status.as_u16(),
        error: body.error,
        reason: body.reason,
    }))
}

fn write_ack(written: WriteResponse) -> QueryResult {
    let mut ack = Document::new();
    ack.insert("ok".to_string(), Value::Bool(true));
    ack.insert("id".to_string(), Value::String(written.id));
    ack.insert("rev".to_string(), Value::String(written.rev));
    QueryResult::Ack(ack)
}

fn create(client: &mut CouchClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let content = payload.into_document();
        let response = client
            .request(Method::POST, None)
            .json(&content)
            .send()
            .await
            .map_err(AdapterError::backend)?;
        let written: WriteResponse = check(response)
            .await?
            .json()
            .await
            .map_err(AdapterError::backend)?;

        let mut stored = content;
        stored.insert("id".to_string(), Value::String(written.id));
        stored.insert("rev".to_string(), Value::String(written.rev));
        Ok(QueryResult::Record(stored))
    })
}

fn read(client: &mut CouchClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let mut query = vec![("include_docs".to_string(), "true".to_string())];
        for (name, value) in payload.as_document() {
            if name != "include_docs" {
                query.push((name.clone(), query_value(name, value)));
            }
        }

        let response = client
            .request(Method::GET, Some("_all_docs"))
            .query(&query)
            .send()
            .await
            .map_err(AdapterError::backend)?;
        let all_docs: AllDocsResponse = check(response)
            .await?
            .json()
            .await
            .map_err(AdapterError::backend)?;

        // Rows for unknown keys carry an error instead of a doc.
        let docs = all_docs
            .rows
            .into_iter()
            .filter_map(|row| match row.doc {
                Some(Value::Object(doc)) => Some(doc),
                _ => None,
            })
            .collect();
        Ok(QueryResult::Records(docs))
    })
}

fn update(client: &mut CouchClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let mut doc = payload.into_document();
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::backend("update requires the document's _id"))?;

        // PUT on a missing id would create it.
        let current = client.fetch(&id).await?;
        if !doc.contains_key("_rev") {
            if let Some(rev) = current.get("_rev") {
                doc.insert("_rev".to_string(), rev.clone());
            }
        }

        let response = client
            .request(Method::PUT, Some(&doc_path(&id)))
            .json(&doc)
            .send()
            .await
            .map_err(AdapterError::backend)?;
        let written: WriteResponse = check(response)
            .await?
            .json()
            .await
            .map_err(AdapterError::backend)?;
        Ok(write_ack(written))
    })
}

fn delete(client: &mut CouchClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let id = payload
            .str_field("id")
            .ok_or_else(|| AdapterError::backend("delete requires an id"))?
            .to_string();

        let current = client.fetch(&id).await?;
        let rev = current
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::backend(format!("document '{}' has no _rev", id)))?;

        let response = client
            .request(Method::DELETE, Some(&doc_path(&id)))
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(AdapterError::backend)?;
        let written: WriteResponse = check(response)
            .await?
            .json()
            .await
            .map_err(AdapterError::backend)?;
        Ok(write_ack(written))
    })
}

#[async_trait]
impl Adapter for CouchDbAdapter {
    type Client = CouchClient;

    async fn acquire(&self, config: &ValidatedConfig) -> AdapterResult<CouchClient> {
        let url = config
            .str("url")
            .ok_or_else(|| AdapterError::connection("url is not configured"))?;
        let database = config
            .str("database")
            .ok_or_else(|| AdapterError::connection("database is not configured"))?;

        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(AdapterError::connection)?;

        let credentials = config.str("username").map(|username| {
            (
                username.to_string(),
                config.str("password").map(str::to_string),
            )
        });

        let client = CouchClient {
            http,
            database_url: format!(
                "{}/{}",
                url.trim_end_matches('/'),
                urlencoding::encode(database)
            ),
            credentials,
        };

        debug!("Checking CouchDB database {}", database);
        let response = client
            .request(Method::HEAD, None)
            .send()
            .await
            .map_err(AdapterError::connection)?;

        match response.status() {
            status if status.is_success() => Ok(client),
            StatusCode::NOT_FOUND => Err(AdapterError::connection(format!(
                "database '{}' does not exist",
                database
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AdapterError::connection(
                format!("access to database '{}' was denied", database),
            )),
            status => Err(AdapterError::connection(format!(
                "unexpected status {} checking database '{}'",
                status, database
            ))),
        }
    }

    async fn release(&self, client: CouchClient) -> AdapterResult<()> {
        debug!("Releasing CouchDB client for {}", client.database_url);
        drop(client);
        Ok(())
    }

    fn handlers(&self) -> HandlerTable<CouchClient> {
        HandlerTable::new()
            .on(Operation::Create, create)
            .on(Operation::Read, read)
            .on(Operation::Update, update)
            .on(Operation::Delete, delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_doc_path_encoding() {
        assert_eq!(doc_path("doc 1"), "doc%201");
        assert_eq!(doc_path("_design/app"), "_design/app");
        assert_eq!(doc_path("a/b"), "a%2Fb");
    }

    #[test]
    fn test_query_value_encoding() {
        assert_eq!(query_value("startkey", &json!("a")), "\"a\"");
        assert_eq!(query_value("keys", &json!(["a", "b"])), "[\"a\",\"b\"]");
        assert_eq!(query_value("limit", &json!(10)), "10");
        assert_eq!(query_value("update", &json!("lazy")), "lazy");
        assert_eq!(query_value("descending", &json!(true)), "true");
    }

    #[test]
    fn test_schema_declares_crud() {
        let schema = schema();
        assert_eq!(schema.operations.len(), 4);
        assert!(schema.config_fields["database"].required);
        assert_eq!(
            schema.operations[&Operation::Delete].payload_kind,
            strata_query::PayloadKind::Structured
        );
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use strata_query::{document, DataError, DatasourceConfig, Dispatcher, QueryRequest};
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, Dispatcher, DatasourceConfig) {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/apps"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut builder = RegistryBuilder::new();
        register(&mut builder).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(builder.seal()));

        let config = DatasourceConfig::new()
            .with_value("url", server.uri())
            .with_value("database", "apps");
        (server, dispatcher, config)
    }

    #[tokio::test]
    async fn test_create_returns_id_and_content() {
        let (server, dispatcher, config) = setup().await;
        Mock::given(method("POST"))
            .and(path("/apps"))
            .and(body_partial_json(json!({"name": "a"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"ok": true, "id": "doc1", "rev": "1-abc"})),
            )
            .mount(&server)
            .await;

        let result = dispatcher
            .execute(
                INTEGRATION,
                &config,
                QueryRequest::document("create", document(json!({"name": "a"}))),
            )
            .await
            .unwrap();

        assert_eq!(
            result,
            QueryResult::Record(document(json!({"id": "doc1", "rev": "1-abc", "name": "a"})))
        );
    }

    #[tokio::test]
    async fn test_read_returns_docs_in_order() {
        let (server, dispatcher, config) = setup().await;
        Mock::given(method("GET"))
            .and(path("/apps/_all_docs"))
            .and(query_param("include_docs", "true"))
            .and(query_param("limit", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_rows": 3,
                "offset": 0,
                "rows": [
                    {"id": "b", "key": "b", "value": {"rev": "1-b"}, "doc": {"_id": "b", "n": 2}},
                    {"id": "a", "key": "a", "value": {"rev": "1-a"}, "doc": {"_id": "a", "n": 1}},
                    {"id": "c", "key": "c", "value": {"rev": "1-c"}, "doc": {"_id": "c", "n": 3}}
                ]
            })))
            .mount(&server)
            .await;

        let result = dispatcher
            .execute(
                INTEGRATION,
                &config,
                QueryRequest::document("read", document(json!({"limit": 3}))),
            )
            .await
            .unwrap();

        let ids: Vec<&str> = result
            .records()
            .unwrap()
            .iter()
            .map(|doc| doc["_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_delete_missing_document_is_not_found() {
        let (server, dispatcher, config) = setup().await;
        Mock::given(method("GET"))
            .and(path("/apps/missing"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({"error": "not_found", "reason": "missing"})),
            )
            .mount(&server)
            .await;

        let err = dispatcher
            .execute(
                INTEGRATION,
                &config,
                QueryRequest::fields("delete", document(json!({"id": "missing"}))),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_delete_uses_current_revision() {
        let (server, dispatcher, config) = setup().await;
        Mock::given(method("GET"))
            .and(path("/apps/doc1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"_id": "doc1", "_rev": "2-x"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/apps/doc1"))
            .and(query_param("rev", "2-x"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true, "id": "doc1", "rev": "3-y"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = dispatcher
            .execute(
                INTEGRATION,
                &config,
                QueryRequest::fields("delete", document(json!({"id": "doc1"}))),
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            QueryResult::Ack(document(json!({"ok": true, "id": "doc1", "rev": "3-y"})))
        );
    }

    #[tokio::test]
    async fn test_update_fills_revision_and_rejects_missing_target() {
        let (server, dispatcher, config) = setup().await;
        Mock::given(method("GET"))
            .and(path("/apps/doc1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"_id": "doc1", "_rev": "1-a", "name": "a"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/apps/doc1"))
            .and(body_partial_json(json!({"_rev": "1-a", "name": "b"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"ok": true, "id": "doc1", "rev": "2-b"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apps/ghost"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({"error": "not_found", "reason": "deleted"})),
            )
            .mount(&server)
            .await;

        let ack = dispatcher
            .execute(
                INTEGRATION,
                &config,
                QueryRequest::document("update", document(json!({"_id": "doc1", "name": "b"}))),
            )
            .await
            .unwrap();
        assert_eq!(ack.record().unwrap()["rev"], json!("2-b"));

        let err = dispatcher
            .execute(
                INTEGRATION,
                &config,
                QueryRequest::document("update", document(json!({"_id": "ghost", "name": "b"}))),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_conflict_is_backend_query_error() {
        let (server, dispatcher, config) = setup().await;
        Mock::given(method("POST"))
            .and(path("/apps"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": "conflict",
                "reason": "Document update conflict."
            })))
            .mount(&server)
            .await;

        let err = dispatcher
            .execute(
                INTEGRATION,
                &config,
                QueryRequest::document("create", document(json!({"_id": "doc1"}))),
            )
            .await
            .unwrap_err();

        match err {
            DataError::BackendQuery { source, .. } => {
                let couch = source.downcast_ref::<CouchError>().unwrap();
                assert_eq!(couch.status, 409);
                assert_eq!(couch.error, "conflict");
            }
            other => panic!("Expected BackendQuery, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_database_is_connection_error() {
        let (server, dispatcher, _) = setup().await;
        Mock::given(method("HEAD"))
            .and(path("/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = DatasourceConfig::new()
            .with_value("url", server.uri())
            .with_value("database", "ghost");
        let err = dispatcher
            .execute(
                INTEGRATION,
                &config,
                QueryRequest::document("read", Document::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Connection { .. }));
    }
}
