//! PostgreSQL adapter for strata-query
//!
//! Every operation takes a structured payload with a `sql` statement. Clients
//! are pooled per connection target inside the adapter, so `release` returns
//! the connection to its pool instead of closing it.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{pin_mut, TryStreamExt};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use strata_query::{
    Adapter, AdapterError, AdapterResult, ClientPool, Document, FieldDescriptor, FieldType,
    HandlerTable, IntegrationSchema, Operation, OperationSpec, Payload, PoolSettings, Pooled,
    QueryResult, RegistryBuilder, Result, ValidatedConfig,
};
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

/// Registry name of the PostgreSQL integration
pub const INTEGRATION: &str = "postgres";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn schema() -> IntegrationSchema {
    let statement = || {
        OperationSpec::structured().with_field(
            "sql",
            FieldDescriptor::required(FieldType::Longform)
                .with_description("SQL statement to run"),
        )
    };

    IntegrationSchema::new(INTEGRATION)
        .with_friendly_name("PostgreSQL")
        .with_documentation_url("https://www.postgresql.org/docs/")
        .with_description("PostgreSQL is an open-source object-relational database system.")
        .with_config_field(
            "host",
            FieldDescriptor::required(FieldType::String).with_default("localhost"),
        )
        .with_config_field(
            "port",
            FieldDescriptor::optional(FieldType::Number).with_default(5432),
        )
        .with_config_field("database", FieldDescriptor::required(FieldType::String))
        .with_config_field("user", FieldDescriptor::required(FieldType::String))
        .with_config_field("password", FieldDescriptor::optional(FieldType::Password))
        .with_config_field(
            "pool_size",
            FieldDescriptor::optional(FieldType::Number)
                .with_default(10)
                .with_description("Maximum open connections per target"),
        )
        .with_config_field(
            "pool_timeout_ms",
            FieldDescriptor::optional(FieldType::Number)
                .with_default(5000)
                .with_description("How long a query waits for a free connection"),
        )
        .with_operation(Operation::Create, statement())
        .with_operation(Operation::Read, statement())
        .with_operation(Operation::Update, statement())
        .with_operation(Operation::Delete, statement())
}

/// Register the PostgreSQL schema and adapter
pub fn register(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register(schema(), PostgresAdapter::new())?;
    Ok(())
}

/// Where a pooled connection points
struct Target {
    host: String,
    port: u16,
    database: String,
    user: String,
    password: Option<String>,
}

impl Target {
    fn from_config(config: &ValidatedConfig) -> AdapterResult<Self> {
        let field = |name: &str| {
            config
                .str(name)
                .map(str::to_string)
                .ok_or_else(|| AdapterError::connection(format!("{} is not configured", name)))
        };

        let port = config.u64("port").unwrap_or(5432);
        let port = u16::try_from(port)
            .map_err(|_| AdapterError::connection(format!("port {} is out of range", port)))?;

        Ok(Self {
            host: field("host")?,
            port,
            database: field("database")?,
            user: field("user")?,
            password: config.str("password").map(str::to_string),
        })
    }

    /// Pool key. The password only contributes a hash.
    fn key(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.password.hash(&mut hasher);
        format!(
            "{}@{}:{}/{}#{:x}",
            self.user,
            self.host,
            self.port,
            self.database,
            hasher.finish()
        )
    }

    async fn connect(&self) -> AdapterResult<Client> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(password) = &self.password {
            config.password(password);
        }

        debug!(
            "Connecting to PostgreSQL: {}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        );

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(AdapterError::connection)?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(client)
    }
}

/// Targets kept pooled before unused pools are evicted
pub const DEFAULT_MAX_POOLS: usize = 64;

/// PostgreSQL adapter holding one connection pool per target.
///
/// Pools are created on first use. Once `max_pools` targets are pooled, a new
/// target evicts every pool with no checked-out connection, dropping its idle
/// connections. Pools in use are never evicted, so the count can exceed
/// `max_pools` while that many targets are busy at once.
pub struct PostgresAdapter {
    pools: Mutex<HashMap<String, Arc<ClientPool<Client>>>>,
    max_pools: usize,
}

impl Default for PostgresAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresAdapter {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            max_pools: DEFAULT_MAX_POOLS,
        }
    }

    pub fn with_max_pools(mut self, max_pools: usize) -> Self {
        self.max_pools = max_pools.max(1);
        self
    }

    /// Pool for a target. Settings of the first query to reach a target win.
    async fn pool_for(&self, target: &Target, settings: PoolSettings) -> Arc<ClientPool<Client>> {
        let key = target.key();
        let mut pools = self.pools.lock().await;

        if !pools.contains_key(&key) && pools.len() >= self.max_pools {
            let before = pools.len();
            pools.retain(|_, pool| Arc::strong_count(pool) > 1 || !pool.is_unused());
            debug!("Evicted {} unused PostgreSQL pools", before - pools.len());
        }

        pools
            .entry(key)
            .or_insert_with(|| {
                debug!(
                    "Creating PostgreSQL pool for {}:{}/{} (max {})",
                    target.host, target.port, target.database, settings.max_size
                );
                Arc::new(ClientPool::new(settings).with_health_check(|c: &Client| !c.is_closed()))
            })
            .clone()
    }

    /// Number of distinct targets with a pool
    pub async fn pool_count(&self) -> usize {
        self.pools.lock().await.len()
    }

    /// Close every pool and drop idle connections
    pub async fn close(&self) {
        let pools: Vec<_> = self.pools.lock().await.drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

/// Pooled connection checked out for one query
pub struct PgClient {
    pool: Arc<ClientPool<Client>>,
    conn: Pooled<Client>,
}

/// Map PostgreSQL row to Document
fn row_to_document(row: &Row) -> Document {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| (column.name().to_string(), extract_value(row, idx)))
        .collect()
}

/// Extract value from PostgreSQL row by column type
fn extract_value(row: &Row, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_().name();

    match type_name {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),

        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),

        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),

        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),

        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),

        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),

        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),

        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),

        "json" | "jsonb" => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),

        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),

        // varchar, text, bpchar, name and anything else readable as text
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Rows and affected count of one statement
struct Executed {
    rows: Vec<Document>,
    rows_affected: u64,
}

impl Executed {
    /// Returned rows if any, else an acknowledgment with the affected count.
    /// `require_match` turns zero affected rows into not-found.
    fn into_result(self, require_match: bool) -> AdapterResult<QueryResult> {
        if require_match && self.rows_affected == 0 && self.rows.is_empty() {
            return Err(AdapterError::not_found("statement matched no rows"));
        }
        if !self.rows.is_empty() {
            return Ok(QueryResult::Records(self.rows));
        }

        let mut ack = Document::new();
        ack.insert(
            "rows_affected".to_string(),
            Value::Number(self.rows_affected.into()),
        );
        Ok(QueryResult::Ack(ack))
    }
}

async fn run_statement(client: &Client, payload: &Payload) -> AdapterResult<Executed> {
    let sql = payload
        .str_field("sql")
        .ok_or_else(|| AdapterError::backend("payload has no sql statement"))?;

    debug!("Executing SQL: {}", sql);
    let stream = client
        .query_raw(sql, std::iter::empty::<&(dyn ToSql + Sync)>())
        .await
        .map_err(AdapterError::backend)?;
    pin_mut!(stream);

    let mut rows = Vec::new();
    while let Some(row) = stream.try_next().await.map_err(AdapterError::backend)? {
        rows.push(row_to_document(&row));
    }
    let rows_affected = stream.rows_affected().unwrap_or(rows.len() as u64);

    Ok(Executed {
        rows,
        rows_affected,
    })
}

fn create(client: &mut PgClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move { run_statement(&client.conn, &payload).await?.into_result(false) })
}

fn read(client: &mut PgClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move {
        let executed = run_statement(&client.conn, &payload).await?;
        Ok(QueryResult::Records(executed.rows))
    })
}

fn update(client: &mut PgClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move { run_statement(&client.conn, &payload).await?.into_result(true) })
}

fn delete(client: &mut PgClient, payload: Payload) -> BoxFuture<'_, AdapterResult<QueryResult>> {
    Box::pin(async move { run_statement(&client.conn, &payload).await?.into_result(true) })
}

#[async_trait]
impl Adapter for PostgresAdapter {
    type Client = PgClient;

    async fn acquire(&self, config: &ValidatedConfig) -> AdapterResult<PgClient> {
        let target = Target::from_config(config)?;
        let pool = self
            .pool_for(&target, PoolSettings::from_config(config))
            .await;
        let conn = pool.checkout(|| target.connect()).await?;
        Ok(PgClient { pool, conn })
    }

    async fn release(&self, client: PgClient) -> AdapterResult<()> {
        let PgClient { pool, conn } = client;
        if conn.is_closed() {
            debug!("Discarding closed PostgreSQL connection");
            pool.discard(conn);
        } else {
            pool.checkin(conn).await;
        }
        Ok(())
    }

    fn handlers(&self) -> HandlerTable<PgClient> {
        HandlerTable::new()
            .on(Operation::Create, create)
            .on(Operation::Read, read)
            .on(Operation::Update, update)
            .on(Operation::Delete, delete)
    }
}
