//! MongoDB implementation of the strata-query Adapter trait
//!
//! Each query opens a driver client, runs against one configured collection
//! and shuts the client down on release.
//!
//! Documents cross the boundary as JSON. Extended JSON (`{"$oid": ...}`) in
//! payloads is honored; ObjectIds and dates in results come back as strings.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata_query::{document, DatasourceConfig, Dispatcher, QueryRequest, RegistryBuilder};
//!
//! # async fn example() -> strata_query::Result<()> {
//! let mut builder = RegistryBuilder::new();
//! strata_query_mongodb::register(&mut builder)?;
//! let dispatcher = Dispatcher::new(Arc::new(builder.seal()));
//!
//! let config = DatasourceConfig::new()
//!     .with_value("database", "app")
//!     .with_value("collection", "users");
//! let active = dispatcher
//!     .execute(
//!         "mongodb",
//!         &config,
//!         QueryRequest::document("read", document(serde_json::json!({"active": true}))),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson};
use futures::future::BoxFuture;
use futures::TryStreamExt;
use mongodb::{options::ClientOptions, Client, Collection};
use serde_json::Value;
use std::time::Duration;
use strata_query::{
    Adapter, AdapterError, AdapterResult, Document, FieldDescriptor, FieldType, HandlerTable,
    IntegrationSchema, Operation, OperationSpec, Payload, QueryResult, RegistryBuilder, Result,
    ValidatedConfig,
};
use tracing::debug;

/// Registry name of the MongoDB integration
pub const INTEGRATION: &str = "mongodb";

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub fn schema() -> IntegrationSchema {
    IntegrationSchema::new(INTEGRATION)
        .with_friendly_name("MongoDB")
        .with_documentation_url("https://www.mongodb.com/docs/drivers/rust/current/")
        .with_description("MongoDB is a source-available document database.")
        .with_config_field(
            "url",
            FieldDescriptor::required(FieldType::String)
                .with_default("mongodb://localhost:27017"),
        )
        .with_config_field("database", FieldDescriptor::required(FieldType::String))
        .with_config_field("collection", FieldDescriptor::required(FieldType::String))
        .with_operation(Operation::Create, OperationSpec::document())
        .with_operation(Operation::Read, OperationSpec::document())
        .with_operation(Operation::Update, OperationSpec::document())
        .with_operation(
            Operation::Delete,
            OperationSpec::structured()
                .with_field("id", FieldDescriptor::required(FieldType::String)),
        )
}

/// Register the MongoDB schema and adapter
pub fn register(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register(schema(), MongoDbAdapter)?;
    Ok(())
}

/// MongoDB adapter
#[derive(Debug, Default, Clone, Copy)]
pub struct MongoDbAdapter;

/// Driver client plus the configured collection
pub struct MongoClient {
    client: Client,
    collection: Collection<bson::Document>,
}

/// Convert a JSON object into a BSON document, honoring extended JSON
fn to_bson_document(doc: Document) -> AdapterResult<bson::Document> {
    match Bson::try_from(Value::Object(doc)).map_err(AdapterError::backend)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(AdapterError::backend(format!(
            "expected a document, got {:?}",
            other.element_type()
        ))),
    }
}

/// Convert BSON to plain JSON. ObjectIds become hex strings and dates RFC 3339.
fn to_json(value: Bson) -> Value {
    match value {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or_else(|_| Bson::DateTime(dt).into_relaxed_extjson()),
        Bson::Document(doc) => Value::Object(to_json_document(doc)),
        Bson::Array(items) => Value::Array(items.into_iter().map(to_json).collect()),
        other => other.into_relaxed_extjson(),
    }
}

fn to_json_document(doc: bson::Document) -> Document {
    doc.into_iter().map(|(k, v)| (k, to_json(v))).collect()
}

/// Filter on `_id`. Strings that parse as an ObjectId match the ObjectId.
fn id_filter(id: Bson) -> bson::Document {
    match id {
        Bson::String(s) => match ObjectId::parse_str(&s) {
            Ok(oid) => doc! { "_id": oid },
            Err(_) => doc! { "_id": s },
        },
        other => doc! { "_id": other },
    }
}

fn create(client: &mut MongoClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let content = payload.into_document();
        let inserted = client
            .collection
            .insert_one(to_bson_document(content.clone())?)
            .await
            .map_err(AdapterError::backend)?;

        let mut stored = content;
        stored.insert("id".to_string(), to_json(inserted.inserted_id));
        Ok(QueryResult::Record(stored))
    })
}

fn read(client: &mut MongoClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let filter = to_bson_document(payload.into_document())?;
        let docs: Vec<bson::Document> = client
            .collection
            .find(filter)
            .await
            .map_err(AdapterError::backend)?
            .try_collect()
            .await
            .map_err(AdapterError::backend)?;

        Ok(QueryResult::Records(
            docs.into_iter().map(to_json_document).collect(),
        ))
    })
}

fn update(client: &mut MongoClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let mut changes = to_bson_document(payload.into_document())?;
        let id = changes
            .remove("_id")
            .ok_or_else(|| AdapterError::backend("update requires the document's _id"))?;
        let filter = id_filter(id);

        // An empty $set is rejected by the server; only check existence then.
        let (matched, modified) = if changes.is_empty() {
            let found = client
                .collection
                .find_one(filter)
                .await
                .map_err(AdapterError::backend)?;
            (u64::from(found.is_some()), 0)
        } else {
            let result = client
                .collection
                .update_one(filter, doc! { "$set": changes })
                .await
                .map_err(AdapterError::backend)?;
            (result.matched_count, result.modified_count)
        };

        if matched == 0 {
            return Err(AdapterError::not_found("no document matched the given _id"));
        }

        let mut ack = Document::new();
        ack.insert("matched".to_string(), Value::from(matched));
        ack.insert("modified".to_string(), Value::from(modified));
        Ok(QueryResult::Ack(ack))
    })
}

fn delete(client: &mut MongoClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let id = payload
            .str_field("id")
            .ok_or_else(|| AdapterError::backend("delete requires an id"))?
            .to_string();
        let filter = id_filter(Bson::String(id.clone()));

        let existing = client
            .collection
            .find_one(filter.clone())
            .await
            .map_err(AdapterError::backend)?;
        if existing.is_none() {
            return Err(AdapterError::not_found(format!("document '{}'", id)));
        }

        let result = client
            .collection
            .delete_one(filter)
            .await
            .map_err(AdapterError::backend)?;

        let mut ack = Document::new();
        ack.insert("id".to_string(), Value::String(id));
        ack.insert("deleted".to_string(), Value::from(result.deleted_count));
        Ok(QueryResult::Ack(ack))
    })
}

#[async_trait]
impl Adapter for MongoDbAdapter {
    type Client = MongoClient;

    async fn acquire(&self, config: &ValidatedConfig) -> AdapterResult<MongoClient> {
        let field = |name: &str| {
            config
                .str(name)
                .ok_or_else(|| AdapterError::connection(format!("{} is not configured", name)))
        };
        let url = field("url")?;
        let database = field("database")?;
        let collection = field("collection")?;

        let mut options = ClientOptions::parse(url)
            .await
            .map_err(AdapterError::connection)?;
        options
            .server_selection_timeout
            .get_or_insert(SERVER_SELECTION_TIMEOUT);

        let client = Client::with_options(options).map_err(AdapterError::connection)?;
        let db = client.database(database);

        debug!("Pinging MongoDB database {}", database);
        if let Err(e) = db.run_command(doc! { "ping": 1 }).await {
            client.shutdown().await;
            return Err(AdapterError::connection(e));
        }

        Ok(MongoClient {
            collection: db.collection(collection),
            client,
        })
    }

    async fn release(&self, client: MongoClient) -> AdapterResult<()> {
        client.client.shutdown().await;
        debug!("MongoDB client shut down");
        Ok(())
    }

    fn handlers(&self) -> HandlerTable<MongoClient> {
        HandlerTable::new()
            .on(Operation::Create, create)
            .on(Operation::Read, read)
            .on(Operation::Update, update)
            .on(Operation::Delete, delete)
    }
}
