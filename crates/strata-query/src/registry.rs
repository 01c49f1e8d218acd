use crate::error::{DataError, Result};
use crate::lifecycle::{Adapter, Binding, BoundAdapter};
use crate::schema::IntegrationSchema;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct Entry {
    pub(crate) schema: IntegrationSchema,
    pub(crate) adapter: Arc<dyn BoundAdapter>,
}

/// Init-phase registry. All registration happens here; [`RegistryBuilder::seal`]
/// turns it into the read-only [`Registry`] queries run against.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<String, Entry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration schema together with its adapter
    pub fn register<A: Adapter>(
        &mut self,
        schema: IntegrationSchema,
        adapter: A,
    ) -> Result<&mut Self> {
        self.register_shared(schema, Arc::new(adapter))
    }

    /// Register an adapter the caller keeps a handle to
    ///
    /// Fails when the name is taken or when the adapter has no handler for an
    /// operation the schema declares.
    pub fn register_shared<A: Adapter>(
        &mut self,
        schema: IntegrationSchema,
        adapter: Arc<A>,
    ) -> Result<&mut Self> {
        if self.entries.contains_key(&schema.name) {
            return Err(DataError::AlreadyRegistered(schema.name));
        }

        let binding = Binding::new(adapter);
        if let Some(operation) = schema.operations.keys().find(|op| !binding.handles(op)) {
            return Err(DataError::MissingHandler {
                integration: schema.name.clone(),
                operation: operation.to_string(),
            });
        }

        debug!(
            "Registered integration {} with {} operations",
            schema.name,
            schema.operations.len()
        );
        self.entries.insert(
            schema.name.clone(),
            Entry {
                schema,
                adapter: Arc::new(binding),
            },
        );
        Ok(self)
    }

    pub fn lookup(&self, name: &str) -> Result<&IntegrationSchema> {
        self.entries
            .get(name)
            .map(|entry| &entry.schema)
            .ok_or_else(|| DataError::not_found(format!("integration '{}'", name)))
    }

    /// End the init phase
    pub fn seal(self) -> Registry {
        debug!("Sealed registry with {} integrations", self.entries.len());
        Registry {
            entries: self.entries,
        }
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("integrations", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Read-only set of registered integrations, shared across concurrent queries
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn lookup(&self, name: &str) -> Result<&IntegrationSchema> {
        self.entry(name).map(|entry| &entry.schema)
    }

    pub(crate) fn entry(&self, name: &str) -> Result<&Entry> {
        self.entries
            .get(name)
            .ok_or_else(|| DataError::not_found(format!("integration '{}'", name)))
    }

    /// Registered integration names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered schemas, sorted by name
    pub fn schemas(&self) -> Vec<&IntegrationSchema> {
        let mut schemas: Vec<&IntegrationSchema> =
            self.entries.values().map(|entry| &entry.schema).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("integrations", &self.names())
            .finish()
    }
}
