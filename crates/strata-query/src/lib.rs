//! # strata-query
//!
//! Core abstractions for issuing uniform CRUD-style queries against
//! heterogeneous data stores.
//!
//! Backends plug in as adapters:
//! - CouchDB (REST document store) - `strata-query-couchdb`
//! - PostgreSQL (SQL, pooled) - `strata-query-postgres`
//! - MongoDB (Document) - `strata-query-mongodb`
//!
//! ## Architecture
//!
//! - **IntegrationSchema**: immutable description of configuration fields and
//!   supported operations, with their payload kind
//! - **RegistryBuilder / Registry**: register schemas with their adapters during
//!   init, then seal into a read-only registry
//! - **Adapter**: acquire/release a backend client and expose an
//!   operation → handler table
//! - **Dispatcher**: validates requests and configuration, runs the handler
//!   inside a scoped client lease and normalizes errors
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strata_query::{
//!     DatasourceConfig, Dispatcher, FieldDescriptor, FieldType, IntegrationSchema, Operation,
//!     OperationSpec, Registry,
//! };
//!
//! let schema = IntegrationSchema::new("docstore")
//!     .with_config_field("url", FieldDescriptor::required(FieldType::String))
//!     .with_config_field("database", FieldDescriptor::required(FieldType::String))
//!     .with_operation(Operation::Read, OperationSpec::document());
//!
//! // let mut builder = Registry::builder();
//! // builder.register(schema, MyAdapter::new())?;
//! // let dispatcher = Dispatcher::new(Arc::new(builder.seal()));
//! // let rows = dispatcher.execute("docstore", &config, request).await?;
//! # let _ = (schema, DatasourceConfig::new());
//! # let _ = |r: Arc<Registry>| Dispatcher::new(r);
//! ```
//!
//! ## Backend Implementation
//!
//! 1. Declare an `IntegrationSchema` for the backend
//! 2. Implement `Adapter`: `acquire`, `release` and a `HandlerTable` covering
//!    every operation the schema declares
//! 3. Register both with a `RegistryBuilder` during startup

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod schema;
pub mod types;

// Re-export commonly used items
pub use config::{DatasourceConfig, ValidatedConfig};
pub use dispatcher::{CallState, Dispatcher, QueryOutcome};
pub use error::{AdapterError, AdapterResult, BoxError, DataError, Result};
pub use lifecycle::{Adapter, ClientLease, HandlerTable, Lifecycle, OperationHandler};
pub use pool::{ClientPool, PoolSettings, Pooled, MAX_POOL_SIZE};
pub use registry::{Registry, RegistryBuilder};
pub use schema::{IntegrationSchema, OperationSpec};
pub use tokio_util::sync::CancellationToken;
pub use types::{
    document, Document, FieldDescriptor, FieldType, Operation, Payload, PayloadKind, QueryRequest,
    QueryResult,
};
