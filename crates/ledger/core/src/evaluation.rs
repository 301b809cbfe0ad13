//! Action evaluation seam.
//!
//! The ledger calls an [`ActionEvaluator`] for every action of every block it
//! accepts. Evaluation either produces state updates or a failure code that
//! is reported back to whoever submitted the action. Failed actions are still
//! marked processed so they are never resubmitted.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::types::{Action, ActionId, Address, StateMap, StateValue};

/// Why an action could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureCode {
    /// No handler is registered for the action's type id
    UnknownAction,
    /// The payload does not decode for its type id
    MalformedPayload,
    /// The state the action depends on no longer holds
    PreconditionFailed,
    /// The handler refused the action for any other reason
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ActionFailure {
    pub code: FailureCode,
    pub message: String,
}

impl ActionFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(FailureCode::PreconditionFailed, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOutcome {
    Succeeded,
    Failed(ActionFailure),
}

/// Result of evaluating one action inside an accepted block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEvaluation {
    pub action_id: ActionId,
    pub signer: Address,
    pub type_id: String,
    pub block_index: u64,
    pub outcome: ActionOutcome,
}

/// Block-level facts available to a handler.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext {
    pub signer: Address,
    pub miner: Option<Address>,
    pub block_index: u64,
}

/// Copy-on-write view over the states preceding an action.
///
/// Reads fall through to the base map; writes stay local until the ledger
/// commits them, so a failed action leaves no trace.
pub struct StateDelta<'a> {
    base: &'a StateMap,
    updates: StateMap,
}

impl<'a> StateDelta<'a> {
    pub fn new(base: &'a StateMap) -> Self {
        Self {
            base,
            updates: StateMap::new(),
        }
    }

    pub fn get(&self, address: &Address) -> Option<&StateValue> {
        self.updates.get(address).or_else(|| self.base.get(address))
    }

    pub fn set(&mut self, address: Address, value: StateValue) {
        self.updates.insert(address, value);
    }

    pub fn into_updates(self) -> StateMap {
        self.updates
    }
}

/// Executes one action type.
pub trait ActionHandler: Send + Sync {
    fn execute(
        &self,
        ctx: &ActionContext,
        action: &Action,
        states: &mut StateDelta<'_>,
    ) -> Result<(), ActionFailure>;
}

/// Executes any action the ledger encounters.
pub trait ActionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        ctx: &ActionContext,
        action: &Action,
        states: &mut StateDelta<'_>,
    ) -> Result<(), ActionFailure>;
}

/// Dispatches actions to handlers by type id.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `type_id`, replacing any earlier handler.
    pub fn register(mut self, type_id: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        self.handlers.insert(type_id.into(), Arc::new(handler));
        self
    }
}

impl ActionEvaluator for ActionRegistry {
    fn evaluate(
        &self,
        ctx: &ActionContext,
        action: &Action,
        states: &mut StateDelta<'_>,
    ) -> Result<(), ActionFailure> {
        match self.handlers.get(action.type_id()) {
            Some(handler) => handler.execute(ctx, action, states),
            None => Err(ActionFailure::new(
                FailureCode::UnknownAction,
                format!("no handler for action type '{}'", action.type_id()),
            )),
        }
    }
}
