//! Points price gate.
//!
//! Runs ahead of the normal tier for every line. When the line starts with a
//! priced command the sender is charged up front; a later failure in the same
//! dispatch credits the points back through the rollback log.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::changelog::{ChangeEntry, Changelog, RetentionPolicy};
use crate::dispatch::{
    CommandHandler, CommandPattern, CommandRegistration, HandlerOutcome, Invocation, Priority,
    RollbackEntry,
};
use crate::locale::Translator;

pub const POINTS_RESOURCE: &str = "points";

#[derive(Debug, Error)]
pub enum PointsError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PointsLedger: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64, PointsError>;

    /// Withdraw `amount` if the balance covers it. Returns `false` and leaves
    /// the balance untouched otherwise.
    async fn charge(&self, user_id: &str, amount: i64, actor: &str) -> Result<bool, PointsError>;

    /// Deposit `amount`. Returns the new balance.
    async fn credit(&self, user_id: &str, amount: i64, actor: &str) -> Result<i64, PointsError>;
}

/// In-memory ledger with a per-user change history
pub struct MemoryPointsLedger {
    balances: DashMap<String, i64>,
    history: Changelog<i64>,
}

impl MemoryPointsLedger {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            balances: DashMap::new(),
            history: Changelog::new(retention),
        }
    }

    pub fn set_balance(&self, user_id: &str, amount: i64) {
        self.balances.insert(user_id.to_string(), amount);
    }

    /// Changes for a user, oldest first
    pub fn history(&self, user_id: &str) -> Vec<ChangeEntry<i64>> {
        self.history.entries(user_id)
    }

    /// Revert the most recent change for a user if it is still inside the
    /// retention window. Returns the reverted delta.
    pub fn undo_last(&self, user_id: &str) -> Option<i64> {
        let entry = self.history.pop_last(user_id)?;
        *self.balances.entry(user_id.to_string()).or_insert(0) -= entry.change;

        tracing::info!(
            user_id = %user_id,
            delta = entry.change,
            actor = %entry.actor,
            "Points change reverted"
        );
        Some(entry.change)
    }
}

impl Default for MemoryPointsLedger {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

#[async_trait]
impl PointsLedger for MemoryPointsLedger {
    async fn balance(&self, user_id: &str) -> Result<i64, PointsError> {
        Ok(self.balances.get(user_id).map(|b| *b).unwrap_or(0))
    }

    async fn charge(&self, user_id: &str, amount: i64, actor: &str) -> Result<bool, PointsError> {
        if amount < 0 {
            return Err(PointsError::InvalidAmount(amount));
        }

        {
            let mut balance = self.balances.entry(user_id.to_string()).or_insert(0);
            if *balance < amount {
                return Ok(false);
            }
            *balance -= amount;
        }

        self.history.record(user_id, actor, -amount);
        Ok(true)
    }

    async fn credit(&self, user_id: &str, amount: i64, actor: &str) -> Result<i64, PointsError> {
        if amount < 0 {
            return Err(PointsError::InvalidAmount(amount));
        }

        let balance = {
            let mut balance = self.balances.entry(user_id.to_string()).or_insert(0);
            *balance += amount;
            *balance
        };

        self.history.record(user_id, actor, amount);
        Ok(balance)
    }
}

pub struct PriceGate {
    ledger: Arc<dyn PointsLedger>,
    translator: Arc<dyn Translator>,
    prices: DashMap<String, i64>,
}

impl PriceGate {
    pub fn new(ledger: Arc<dyn PointsLedger>, translator: Arc<dyn Translator>) -> Self {
        Self {
            ledger,
            translator,
            prices: DashMap::new(),
        }
    }

    /// Set the price of a command. A price of zero removes it.
    pub fn set_price(&self, command: &str, price: i64) {
        let key = normalize(command);
        if price <= 0 {
            self.prices.remove(&key);
        } else {
            self.prices.insert(key, price);
        }
    }

    pub fn price_of(&self, command: &str) -> Option<i64> {
        self.prices.get(&normalize(command)).map(|p| *p)
    }

    /// Registration for the gate: every line, high tier, skippable
    pub fn registration(self: &Arc<Self>) -> CommandRegistration {
        CommandRegistration::new("price", CommandPattern::Any, self.clone())
            .priority(Priority::High)
            .skippable()
    }

    /// Longest priced command prefix of a line
    fn priced_command(&self, line: &str) -> Option<(String, i64)> {
        let tokens: Vec<String> = line.split_whitespace().map(str::to_lowercase).collect();
        (1..=tokens.len()).rev().find_map(|len| {
            let command = tokens[..len].join(" ");
            self.prices.get(&command).map(|price| (command, *price))
        })
    }
}

#[async_trait]
impl CommandHandler for PriceGate {
    async fn handle(&self, invocation: Invocation) -> anyhow::Result<HandlerOutcome> {
        let Some((command, price)) = self.priced_command(&invocation.param) else {
            return Ok(HandlerOutcome::allowed());
        };

        let user_id = invocation.sender_id().to_string();
        let charged = self.ledger.charge(&user_id, price, "price").await?;

        if !charged {
            let mut params = Map::new();
            params.insert(
                "sender".to_string(),
                Value::String(invocation.message.sender.username.clone()),
            );
            params.insert("amount".to_string(), json!(price));
            params.insert("command".to_string(), Value::String(command.clone()));

            tracing::debug!(
                dispatch_id = %invocation.dispatch_id,
                user_id = %user_id,
                command = %command,
                price,
                "Not enough points"
            );

            let text = self
                .translator
                .localize("price.user-have-not-enough-points", &params);
            return Ok(HandlerOutcome::denied(vec![invocation.reply(text)]));
        }

        let ledger = self.ledger.clone();
        let owner = user_id.clone();
        invocation.rollback.register(RollbackEntry::new(
            POINTS_RESOURCE,
            user_id.clone(),
            price,
            move || async move {
                ledger.credit(&owner, price, "rollback").await?;
                Ok(())
            },
        ));

        tracing::debug!(
            dispatch_id = %invocation.dispatch_id,
            user_id = %user_id,
            command = %command,
            price,
            "Points charged"
        );

        Ok(HandlerOutcome::allowed())
    }
}

fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_charge_and_credit() {
        let ledger = MemoryPointsLedger::default();
        ledger.set_balance("1", 50);

        assert!(ledger.charge("1", 20, "price").await.unwrap());
        assert!(!ledger.charge("1", 40, "price").await.unwrap());
        assert_eq!(ledger.balance("1").await.unwrap(), 30);

        assert_eq!(ledger.credit("1", 5, "admin").await.unwrap(), 35);
        assert!(matches!(
            ledger.charge("1", -1, "price").await,
            Err(PointsError::InvalidAmount(-1))
        ));

        let deltas: Vec<i64> = ledger.history("1").into_iter().map(|e| e.change).collect();
        assert_eq!(deltas, vec![-20, 5]);
    }

    #[tokio::test]
    async fn test_undo_last() {
        let ledger = MemoryPointsLedger::new(RetentionPolicy {
            max_age: Duration::from_secs(60),
            max_entries: 10,
        });
        ledger.set_balance("1", 10);
        ledger.charge("1", 4, "price").await.unwrap();

        assert_eq!(ledger.undo_last("1"), Some(-4));
        assert_eq!(ledger.balance("1").await.unwrap(), 10);
        assert_eq!(ledger.undo_last("1"), None);
    }

    #[test]
    fn test_longest_priced_prefix() {
        let gate = PriceGate::new(
            Arc::new(MemoryPointsLedger::default()),
            Arc::new(crate::locale::StaticTranslator::new()),
        );
        gate.set_price("!duel", 10);
        gate.set_price("!Duel  Accept", 2);

        assert_eq!(gate.priced_command("!DUEL accept now"), Some(("!duel accept".to_string(), 2)));
        assert_eq!(gate.priced_command("!duel bob"), Some(("!duel".to_string(), 10)));
        assert_eq!(gate.priced_command("hello"), None);

        gate.set_price("!duel", 0);
        assert_eq!(gate.price_of("!duel"), None);
    }
}
