//! Built-in actions: gold rewards and transfers.
//!
//! Gold lives under the `"gold"` key of the JSON object stored at each
//! account address.

use ledger_core::{
    Action, ActionContext, ActionFailure, ActionHandler, ActionPayload, ActionRegistry, Address,
    EncodeError, FailureCode, StateDelta, StateValue,
};
use serde::{Deserialize, Serialize};

pub const REWARD_GOLD: &str = "reward_gold";
pub const TRANSFER_GOLD: &str = "transfer_gold";

const GOLD_KEY: &str = "gold";

/// Credits the signer with `gold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardGold {
    pub gold: u64,
}

/// Moves `amount` gold from the signer to `recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferGold {
    pub recipient: Address,
    pub amount: u64,
}

/// Gold held by `address`, zero when it holds nothing.
pub fn gold_balance(state: Option<&StateValue>) -> u64 {
    state
        .and_then(|value| value.get(GOLD_KEY))
        .and_then(StateValue::as_u64)
        .unwrap_or(0)
}

fn set_gold(states: &mut StateDelta<'_>, address: Address, gold: u64) {
    let mut account = match states.get(&address) {
        Some(StateValue::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    account.insert(GOLD_KEY.to_string(), StateValue::from(gold));
    states.set(address, StateValue::Object(account));
}

fn decode<T: serde::de::DeserializeOwned>(action: &Action) -> Result<T, ActionFailure> {
    action
        .payload
        .decode()
        .map_err(|e| ActionFailure::new(FailureCode::MalformedPayload, e.to_string()))
}

pub struct RewardGoldHandler;

impl ActionHandler for RewardGoldHandler {
    fn execute(
        &self,
        ctx: &ActionContext,
        action: &Action,
        states: &mut StateDelta<'_>,
    ) -> Result<(), ActionFailure> {
        let RewardGold { gold } = decode(action)?;
        let balance = gold_balance(states.get(&ctx.signer));
        let credited = balance.checked_add(gold).ok_or_else(|| {
            ActionFailure::new(FailureCode::Rejected, "gold balance would overflow")
        })?;
        set_gold(states, ctx.signer, credited);
        Ok(())
    }
}

pub struct TransferGoldHandler;

impl ActionHandler for TransferGoldHandler {
    fn execute(
        &self,
        ctx: &ActionContext,
        action: &Action,
        states: &mut StateDelta<'_>,
    ) -> Result<(), ActionFailure> {
        let TransferGold { recipient, amount } = decode(action)?;

        let available = gold_balance(states.get(&ctx.signer));
        if available < amount {
            return Err(ActionFailure::precondition(format!(
                "insufficient gold: have {}, need {}",
                available, amount
            )));
        }
        set_gold(states, ctx.signer, available - amount);

        let received = gold_balance(states.get(&recipient))
            .checked_add(amount)
            .ok_or_else(|| {
                ActionFailure::new(FailureCode::Rejected, "recipient balance would overflow")
            })?;
        set_gold(states, recipient, received);
        Ok(())
    }
}

/// Registry with every built-in action.
pub fn default_registry() -> ActionRegistry {
    ActionRegistry::new()
        .register(REWARD_GOLD, RewardGoldHandler)
        .register(TRANSFER_GOLD, TransferGoldHandler)
}

/// Reward action carried by each mined block.
pub fn reward_gold_action(signer: Address, gold: u64) -> Result<Action, EncodeError> {
    let payload = ActionPayload::json(REWARD_GOLD, &RewardGold { gold })?;
    Ok(Action::new(signer, payload))
}

pub fn transfer_gold_payload(recipient: Address, amount: u64) -> Result<ActionPayload, EncodeError> {
    ActionPayload::json(TRANSFER_GOLD, &TransferGold { recipient, amount })
}
