//! Query dispatch: schema lookup, validation, scoped client acquisition,
//! adapter execution and error normalization.

use crate::config::{DatasourceConfig, ValidatedConfig};
use crate::error::{DataError, Result};
use crate::lifecycle::Scoped;
use crate::registry::Registry;
use crate::types::{Operation, QueryRequest, QueryResult};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-call state
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CallState {
    Idle,
    Validating,
    Connecting,
    Executing,
    Closing,
    Done,
    Failed,
}

impl CallState {
    /// Whether `next` may follow `self`. `Failed` is reachable from every
    /// step and still leads to `Closing` so cleanup runs before the call ends.
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Connecting)
                | (Connecting, Executing)
                | (Executing, Closing)
                | (Closing, Done)
                | (Failed, Closing)
                | (Idle | Validating | Connecting | Executing | Closing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Done | CallState::Failed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "IDLE",
            CallState::Validating => "VALIDATING",
            CallState::Connecting => "CONNECTING",
            CallState::Executing => "EXECUTING",
            CallState::Closing => "CLOSING",
            CallState::Done => "DONE",
            CallState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one call
pub(crate) struct CallTracker {
    integration: String,
    operation: String,
    state: CallState,
    history: Vec<CallState>,
}

impl CallTracker {
    pub(crate) fn new(integration: &str, operation: &str) -> Self {
        Self {
            integration: integration.to_string(),
            operation: operation.to_string(),
            state: CallState::Idle,
            history: vec![CallState::Idle],
        }
    }

    pub(crate) fn advance(&mut self, next: CallState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid call transition {} -> {}",
            self.state,
            next
        );
        debug!(
            integration = %self.integration,
            operation = %self.operation,
            "{} -> {}",
            self.state,
            next
        );
        self.state = next;
        self.history.push(next);
    }

    pub(crate) fn state(&self) -> CallState {
        self.state
    }

    pub(crate) fn history(&self) -> &[CallState] {
        &self.history
    }
}

/// Result of a call plus a cleanup failure that did not void it
#[derive(Debug)]
pub struct QueryOutcome {
    pub result: QueryResult,
    /// Release failed after a successful execution
    pub cleanup_error: Option<DataError>,
}

/// Entry point for callers. Routes requests to registered adapters.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Execute one operation.
    ///
    /// A release failure is returned as `ResourceCleanup` even when the
    /// operation itself succeeded. Use [`Dispatcher::execute_reported`] to
    /// keep the result in that case.
    pub async fn execute(
        &self,
        integration: &str,
        config: &DatasourceConfig,
        request: QueryRequest,
    ) -> Result<QueryResult> {
        let outcome = self.execute_reported(integration, config, request).await?;
        Self::surface(integration, outcome)
    }

    /// Execute one operation and report a cleanup failure alongside the result
    pub async fn execute_reported(
        &self,
        integration: &str,
        config: &DatasourceConfig,
        request: QueryRequest,
    ) -> Result<QueryOutcome> {
        let never = CancellationToken::new();
        self.run(integration, config, request, &never).await
    }

    /// Execute one operation, aborting the backend call when `cancel` fires.
    /// The client is released either way.
    pub async fn execute_with_cancel(
        &self,
        integration: &str,
        config: &DatasourceConfig,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResult> {
        let outcome = self.run(integration, config, request, cancel).await?;
        Self::surface(integration, outcome)
    }

    /// Turn a cleanup failure into the call's error
    fn surface(integration: &str, outcome: QueryOutcome) -> Result<QueryResult> {
        match outcome.cleanup_error {
            Some(e) => {
                warn!(
                    "Query on {} succeeded but cleanup failed; discarding result",
                    integration
                );
                Err(e)
            }
            None => Ok(outcome.result),
        }
    }

    async fn run(
        &self,
        integration: &str,
        config: &DatasourceConfig,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome> {
        let mut tracker = CallTracker::new(integration, &request.operation);
        let (outcome, state) = self
            .run_tracked(integration, config, request, cancel, &mut tracker)
            .await;
        debug!(
            "Call on {} ended {} via {:?}",
            integration,
            state,
            tracker.history()
        );
        outcome
    }

    async fn run_tracked(
        &self,
        integration: &str,
        config: &DatasourceConfig,
        request: QueryRequest,
        cancel: &CancellationToken,
        tracker: &mut CallTracker,
    ) -> (Result<QueryOutcome>, CallState) {
        tracker.advance(CallState::Validating);

        let entry = match self.registry.entry(integration) {
            Ok(entry) => entry,
            Err(e) => {
                tracker.advance(CallState::Failed);
                return (Err(e), tracker.state());
            }
        };

        let prepared = entry
            .schema
            .resolve_operation(&request.operation)
            .and_then(|(operation, _)| {
                let payload = entry.schema.validate_payload(&operation, request.payload)?;
                let validated = ValidatedConfig::new(&entry.schema, config)?;
                Ok((operation, payload, validated))
            });
        let (operation, payload, validated) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracker.advance(CallState::Failed);
                return (Err(e), tracker.state());
            }
        };

        if cancel.is_cancelled() {
            tracker.advance(CallState::Failed);
            return (
                Err(DataError::cancelled(integration, operation.as_str())),
                tracker.state(),
            );
        }

        let scoped = entry
            .adapter
            .run(&validated, &operation, payload, cancel, tracker)
            .await;

        let outcome = Self::settle(integration, &operation, scoped);
        match (&outcome, tracker.state()) {
            (Ok(_), CallState::Closing) => tracker.advance(CallState::Done),
            (Err(_), state) if !state.is_terminal() => tracker.advance(CallState::Failed),
            _ => {}
        }
        (outcome, tracker.state())
    }

    /// Map a scoped call to the caller-facing result
    fn settle(integration: &str, operation: &Operation, scoped: Scoped) -> Result<QueryOutcome> {
        let op = operation.as_str();
        match scoped {
            Scoped::NoHandler => Err(DataError::MissingHandler {
                integration: integration.to_string(),
                operation: op.to_string(),
            }),
            Scoped::AcquireFailed(e) => Err(DataError::from_acquire(integration, e)),
            Scoped::Cancelled { cleanup } => {
                let cancelled = DataError::cancelled(integration, op);
                match cleanup {
                    Ok(()) => Err(cancelled),
                    Err(e) => Err(DataError::from_cleanup(integration, op, e, Some(cancelled))),
                }
            }
            Scoped::Completed { execution, cleanup } => match (execution, cleanup) {
                (Ok(result), Ok(())) => Ok(QueryOutcome {
                    result,
                    cleanup_error: None,
                }),
                (Ok(result), Err(e)) => Ok(QueryOutcome {
                    result,
                    cleanup_error: Some(DataError::from_cleanup(integration, op, e, None)),
                }),
                (Err(e), Ok(())) => Err(DataError::from_execution(integration, op, e)),
                (Err(e), Err(cleanup)) => {
                    let prior = DataError::from_execution(integration, op, e);
                    Err(DataError::from_cleanup(integration, op, cleanup, Some(prior)))
                }
            },
        }
    }
}
