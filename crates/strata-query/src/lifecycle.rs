//! Connection lifecycle: the adapter contract, per-operation handler tables,
//! and scoped client leases that are released exactly once.

use crate::config::ValidatedConfig;
use crate::dispatcher::{CallState, CallTracker};
use crate::error::{AdapterError, AdapterResult};
use crate::types::{Operation, Payload, QueryResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handler for one operation. Receives the acquired client and the validated payload.
pub type OperationHandler<C> =
    for<'a> fn(&'a mut C, Payload) -> BoxFuture<'a, AdapterResult<QueryResult>>;

/// Explicit operation → handler table of an adapter
pub struct HandlerTable<C> {
    handlers: HashMap<Operation, OperationHandler<C>>,
}

impl<C> HandlerTable<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn on(mut self, operation: Operation, handler: OperationHandler<C>) -> Self {
        self.handlers.insert(operation.canonical(), handler);
        self
    }

    pub fn get(&self, operation: &Operation) -> Option<OperationHandler<C>> {
        self.handlers.get(operation).copied()
    }

    pub fn contains(&self, operation: &Operation) -> bool {
        self.handlers.contains_key(operation)
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.handlers.keys()
    }
}

impl<C> Default for HandlerTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Executor of operations for one integration kind.
///
/// `acquire` opens (or checks out) a client from validated configuration and
/// `release` closes it (or returns it to a pool). The dispatcher pairs the two
/// for every query, whatever the outcome.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Backend client handle owned by one query
    type Client: Send + 'static;

    async fn acquire(&self, config: &ValidatedConfig) -> AdapterResult<Self::Client>;

    async fn release(&self, client: Self::Client) -> AdapterResult<()>;

    /// Handlers for the operations this adapter implements
    fn handlers(&self) -> HandlerTable<Self::Client>;
}

/// Pairs acquire and release for one adapter
pub struct Lifecycle<A: Adapter> {
    adapter: Arc<A>,
}

impl<A: Adapter> Lifecycle<A> {
    pub fn new(adapter: Arc<A>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    /// Acquire a client wrapped in a lease that must be released
    pub async fn acquire(&self, config: &ValidatedConfig) -> AdapterResult<ClientLease<A>> {
        let client = self.adapter.acquire(config).await?;
        Ok(ClientLease {
            adapter: self.adapter.clone(),
            client: Some(client),
        })
    }
}

/// Scoped client handle.
///
/// Consume with [`ClientLease::release`]. A lease dropped unreleased (its
/// query future was cancelled or panicked) hands the client back to the
/// adapter on a background task so release still happens exactly once.
pub struct ClientLease<A: Adapter> {
    adapter: Arc<A>,
    client: Option<A::Client>,
}

impl<A: Adapter> ClientLease<A> {
    pub fn client_mut(&mut self) -> AdapterResult<&mut A::Client> {
        self.client
            .as_mut()
            .ok_or_else(|| AdapterError::backend("client lease already released"))
    }

    pub async fn release(mut self) -> AdapterResult<()> {
        match self.client.take() {
            Some(client) => self.adapter.release(client).await,
            None => Ok(()),
        }
    }
}

impl<A: Adapter> Drop for ClientLease<A> {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        let adapter = self.adapter.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Releasing abandoned client lease in background");
                handle.spawn(async move {
                    if let Err(e) = adapter.release(client).await {
                        warn!("Failed to release abandoned client: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!("No runtime available to release abandoned client; dropping it");
            }
        }
    }
}

/// Raw outcome of one scoped call, before errors are mapped
pub(crate) enum Scoped {
    NoHandler,
    AcquireFailed(AdapterError),
    Cancelled {
        cleanup: AdapterResult<()>,
    },
    Completed {
        execution: AdapterResult<QueryResult>,
        cleanup: AdapterResult<()>,
    },
}

/// Type-erased adapter held by the registry
#[async_trait]
pub(crate) trait BoundAdapter: Send + Sync {
    fn handles(&self, operation: &Operation) -> bool;

    async fn run(
        &self,
        config: &ValidatedConfig,
        operation: &Operation,
        payload: Payload,
        cancel: &CancellationToken,
        tracker: &mut CallTracker,
    ) -> Scoped;
}

/// An adapter bound to its handler table
pub(crate) struct Binding<A: Adapter> {
    lifecycle: Lifecycle<A>,
    handlers: HandlerTable<A::Client>,
}

impl<A: Adapter> Binding<A> {
    pub(crate) fn new(adapter: Arc<A>) -> Self {
        let handlers = adapter.handlers();
        Self {
            lifecycle: Lifecycle::new(adapter),
            handlers,
        }
    }
}

#[async_trait]
impl<A: Adapter> BoundAdapter for Binding<A> {
    fn handles(&self, operation: &Operation) -> bool {
        self.handlers.contains(operation)
    }

    async fn run(
        &self,
        config: &ValidatedConfig,
        operation: &Operation,
        payload: Payload,
        cancel: &CancellationToken,
        tracker: &mut CallTracker,
    ) -> Scoped {
        let Some(handler) = self.handlers.get(operation) else {
            return Scoped::NoHandler;
        };

        tracker.advance(CallState::Connecting);
        let mut lease = match self.lifecycle.acquire(config).await {
            Ok(lease) => lease,
            Err(e) => return Scoped::AcquireFailed(e),
        };

        tracker.advance(CallState::Executing);
        let execution = match lease.client_mut() {
            Ok(client) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = handler(client, payload) => Some(result),
                }
            }
            Err(e) => Some(Err(e)),
        };

        if !matches!(execution, Some(Ok(_))) {
            tracker.advance(CallState::Failed);
        }
        tracker.advance(CallState::Closing);
        let cleanup = lease.release().await;

        match execution {
            Some(execution) => Scoped::Completed { execution, cleanup },
            None => Scoped::Cancelled { cleanup },
        }
    }
}
