//! Custom variable store: admin CRUD plus the template mutation path.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::changelog::{ChangeEntry, Changelog, RetentionPolicy};
use crate::locale::substitute_placeholders;
use crate::metrics::VARIABLE_MUTATIONS_TOTAL;
use crate::permission::SenderCapabilities;

use super::backend::{VariableBackend, VariableBackendError};
use super::types::{
    format_number, parse_number, CreateVariableRequest, CustomVariable, Resolution,
    ResponseType, UpdateVariableRequest, VariableChange, VariableError, VariableKind,
    VariableNotification, VariableResult,
};

/// Parameters of a `$_name` / `$!_name` reference in a template
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    /// Mutation operand, usually the custom command's parameter
    pub operand: Option<&'a str>,
    pub capabilities: &'a SenderCapabilities,
    /// `$!_name`: mutate without a notification
    pub silent: bool,
}

/// How an operand applies to a variable
enum Mutation {
    Add(f64),
    Set(String),
}

pub struct VariableStore {
    backend: Arc<dyn VariableBackend>,
    history: Changelog<VariableChange>,
    default_notification: String,
}

impl VariableStore {
    pub fn new(
        backend: Arc<dyn VariableBackend>,
        retention: RetentionPolicy,
        default_notification: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            history: Changelog::new(retention),
            default_notification: default_notification.into(),
        }
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    /// Create a new variable
    pub async fn create(&self, req: CreateVariableRequest) -> VariableResult<CustomVariable> {
        let variable: CustomVariable = req.into();
        variable.validate()?;

        if !self.backend.insert(variable.clone()).await? {
            return Err(VariableError::AlreadyExists(variable.name));
        }

        tracing::info!(
            variable = %variable.name,
            kind = ?variable.kind,
            "Variable created"
        );
        Ok(variable)
    }

    pub async fn get(&self, name: &str) -> VariableResult<CustomVariable> {
        self.backend
            .get(name)
            .await?
            .ok_or_else(|| VariableError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> VariableResult<Vec<CustomVariable>> {
        Ok(self.backend.list().await?)
    }

    /// Update a variable definition
    pub async fn update(
        &self,
        name: &str,
        updates: UpdateVariableRequest,
    ) -> VariableResult<CustomVariable> {
        let mut variable = self.get(name).await?;

        if let Some(kind) = updates.kind {
            variable.kind = kind;
        }
        if let Some(value) = updates.current_value {
            variable.current_value = value;
        }
        if let Some(step) = updates.step {
            variable.step = step;
        }
        if let Some(permission) = updates.permission {
            variable.permission = permission;
        }
        if let Some(read_only) = updates.read_only {
            variable.read_only = read_only;
        }
        if let Some(response_type) = updates.response_type {
            variable.response_type = response_type;
        }
        if let Some(description) = updates.description {
            variable.description = description;
        }
        variable.updated_at = Utc::now();

        variable.validate()?;

        if !self.backend.replace(variable.clone()).await? {
            return Err(VariableError::NotFound(name.to_string()));
        }

        tracing::info!(variable = %name, "Variable updated");
        Ok(variable)
    }

    /// Administrative write. Ignores `read_only` and permissions but still
    /// validates numeric values.
    pub async fn set_value(
        &self,
        name: &str,
        value: &str,
        actor: &str,
    ) -> VariableResult<CustomVariable> {
        let variable = self.get(name).await?;

        let value = match variable.kind {
            VariableKind::Number => parse_number(value)
                .map(format_number)
                .ok_or_else(|| VariableError::InvalidValue(format!("{} is not a number", value)))?,
            _ => value.to_string(),
        };

        let previous = self
            .backend
            .set_value(name, &value)
            .await?
            .ok_or_else(|| VariableError::NotFound(name.to_string()))?;

        self.history.record(
            name,
            actor,
            VariableChange {
                old_value: previous,
                new_value: value.clone(),
            },
        );

        tracing::info!(variable = %name, actor = %actor, "Variable value set");
        self.get(name).await
    }

    pub async fn delete(&self, name: &str) -> VariableResult<()> {
        if !self.backend.delete(name).await? {
            return Err(VariableError::NotFound(name.to_string()));
        }
        self.history.clear(name);
        tracing::info!(variable = %name, "Variable deleted");
        Ok(())
    }

    /// Prior values of a variable, oldest first
    pub fn history(&self, name: &str) -> Vec<ChangeEntry<VariableChange>> {
        self.history.entries(name)
    }

    /// Resolve a template reference, applying the operand if there is one.
    ///
    /// Returns `Ok(None)` when the variable does not exist.
    #[tracing::instrument(
        name = "variables.resolve",
        skip(self, req),
        fields(sender = %req.capabilities.username, silent = req.silent)
    )]
    pub async fn resolve(
        &self,
        name: &str,
        req: ResolveRequest<'_>,
    ) -> VariableResult<Option<Resolution>> {
        let Some(variable) = self.backend.get(name).await? else {
            return Ok(None);
        };

        let Some(operand) = req.operand.map(str::trim).filter(|op| !op.is_empty()) else {
            return Ok(Some(Resolution::unchanged(variable.current_value)));
        };

        if variable.read_only
            || variable.kind == VariableKind::Eval
            || !req.capabilities.satisfies(variable.permission)
        {
            tracing::debug!(
                variable = %name,
                read_only = variable.read_only,
                required = %variable.permission,
                tier = %req.capabilities.tier,
                "Variable mutation rejected"
            );
            VARIABLE_MUTATIONS_TOTAL.with_label_values(&["rejected"]).inc();
            return Ok(Some(Resolution::unchanged(variable.current_value)));
        }

        let Some(mutation) = parse_mutation(&variable, operand) else {
            tracing::debug!(variable = %name, operand = %operand, "Invalid variable operand");
            VARIABLE_MUTATIONS_TOTAL.with_label_values(&["invalid"]).inc();
            return Ok(Some(Resolution::unchanged(variable.current_value)));
        };

        let change = match mutation {
            Mutation::Add(delta) => match self.backend.atomic_increment(name, delta).await {
                Ok(next) => next.map(|next| VariableChange {
                    old_value: format_number(next - delta),
                    new_value: format_number(next),
                }),
                // Changed concurrently into something the step cannot apply to
                Err(VariableBackendError::NotNumeric(value)) => {
                    tracing::debug!(variable = %name, value = %value, "Variable increment rejected");
                    VARIABLE_MUTATIONS_TOTAL.with_label_values(&["invalid"]).inc();
                    return Ok(Some(Resolution::unchanged(variable.current_value)));
                }
                Err(e) => return Err(e.into()),
            },
            Mutation::Set(value) => self
                .backend
                .set_value(name, &value)
                .await?
                .map(|previous| VariableChange {
                    old_value: previous,
                    new_value: value,
                }),
        };

        // Deleted between the read and the write
        let Some(change) = change else {
            return Ok(None);
        };

        self.history
            .record(name, &req.capabilities.username, change.clone());
        VARIABLE_MUTATIONS_TOTAL.with_label_values(&["applied"]).inc();

        tracing::debug!(
            variable = %name,
            old_value = %change.old_value,
            new_value = %change.new_value,
            "Variable mutated"
        );

        let display = match variable.response_type {
            ResponseType::Inline => change.new_value.clone(),
            _ => change.old_value.clone(),
        };

        let notification = match (&variable.response_type, req.silent) {
            (ResponseType::Inline, _) | (_, true) => None,
            (ResponseType::Custom(text), false) => {
                Some(self.notification(name, text, &change, req.capabilities))
            }
            (ResponseType::Announce, false) => Some(self.notification(
                name,
                &self.default_notification,
                &change,
                req.capabilities,
            )),
        };

        Ok(Some(Resolution {
            display,
            notification,
        }))
    }

    fn notification(
        &self,
        name: &str,
        template: &str,
        change: &VariableChange,
        capabilities: &SenderCapabilities,
    ) -> VariableNotification {
        let mut params = Map::new();
        params.insert("sender".to_string(), json!(capabilities.username));
        params.insert("variable".to_string(), json!(name));
        params.insert("value".to_string(), Value::String(change.new_value.clone()));
        params.insert(
            "old_value".to_string(),
            Value::String(change.old_value.clone()),
        );

        VariableNotification {
            variable: name.to_string(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            text: substitute_placeholders(template, &params),
        }
    }
}

/// Number variables: `+`/`-` step, `+N`/`-N` add, `N` set. Additions whose
/// result would not be finite are rejected.
/// Text variables: any operand except a bare `+`/`-` replaces the value.
fn parse_mutation(variable: &CustomVariable, operand: &str) -> Option<Mutation> {
    let add = |delta: f64| {
        let current = parse_number(&variable.current_value)?;
        (current + delta).is_finite().then_some(Mutation::Add(delta))
    };

    match variable.kind {
        VariableKind::Number => match operand {
            "+" => add(variable.step),
            "-" => add(-variable.step),
            op if op.starts_with('+') || op.starts_with('-') => parse_number(op).and_then(add),
            op => parse_number(op).map(|n| Mutation::Set(format_number(n))),
        },
        VariableKind::Text => match operand {
            "+" | "-" => None,
            op => Some(Mutation::Set(op.to_string())),
        },
        VariableKind::Eval => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Sender;
    use crate::permission::PermissionTier;
    use crate::variables::MemoryVariableBackend;

    fn store() -> VariableStore {
        VariableStore::new(
            Arc::new(MemoryVariableBackend::new()),
            RetentionPolicy::default(),
            "{{sender}}, {{variable}} was set to {{value}}.",
        )
    }

    fn viewer() -> SenderCapabilities {
        SenderCapabilities::viewer(&Sender::new("u1", "alice"))
    }

    fn moderator() -> SenderCapabilities {
        let mut caps = SenderCapabilities::viewer(&Sender::new("u2", "mod"));
        caps.tier = PermissionTier::Moderator;
        caps.is_moderator = true;
        caps
    }

    fn request<'a>(operand: Option<&'a str>, caps: &'a SenderCapabilities) -> ResolveRequest<'a> {
        ResolveRequest {
            operand,
            capabilities: caps,
            silent: false,
        }
    }

    #[tokio::test]
    async fn test_create_duplicate_and_invalid() {
        let store = store();
        store
            .create(CreateVariableRequest::new("$_deaths", VariableKind::Number))
            .await
            .unwrap();

        let dup = store
            .create(CreateVariableRequest::new("$_deaths", VariableKind::Number))
            .await;
        assert!(matches!(dup, Err(VariableError::AlreadyExists(_))));

        let bad = store
            .create(CreateVariableRequest::new("$_n", VariableKind::Number).value("abc"))
            .await;
        assert!(matches!(bad, Err(VariableError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_plain_reference_reads_value() {
        let store = store();
        store
            .create(CreateVariableRequest::new("$_game", VariableKind::Text).value("chess"))
            .await
            .unwrap();

        let caps = viewer();
        let res = store
            .resolve("$_game", request(None, &caps))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.display, "chess");
        assert!(res.notification.is_none());
        assert!(store.resolve("$_missing", request(None, &caps)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_increment_and_decrement() {
        let store = store();
        store
            .create(
                CreateVariableRequest::new("$_count", VariableKind::Number)
                    .value("5")
                    .step(2.0)
                    .response_type(ResponseType::Inline),
            )
            .await
            .unwrap();

        let caps = viewer();
        let up = store.resolve("$_count", request(Some("+"), &caps)).await.unwrap().unwrap();
        assert_eq!(up.display, "7");
        let down = store.resolve("$_count", request(Some("-"), &caps)).await.unwrap().unwrap();
        assert_eq!(down.display, "5");

        let rejected = store
            .resolve("$_count", request(Some("abc"), &caps))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejected.display, "5");
        assert_eq!(store.get("$_count").await.unwrap().current_value, "5");
    }

    #[tokio::test]
    async fn test_signed_and_plain_numeric_operands() {
        let store = store();
        store
            .create(
                CreateVariableRequest::new("$_score", VariableKind::Number)
                    .value("10")
                    .response_type(ResponseType::Inline),
            )
            .await
            .unwrap();

        let caps = viewer();
        let res = store.resolve("$_score", request(Some("+15"), &caps)).await.unwrap().unwrap();
        assert_eq!(res.display, "25");
        let res = store.resolve("$_score", request(Some("-30"), &caps)).await.unwrap().unwrap();
        assert_eq!(res.display, "-5");
        let res = store.resolve("$_score", request(Some("3"), &caps)).await.unwrap().unwrap();
        assert_eq!(res.display, "3");
        assert_eq!(store.history("$_score").len(), 3);
    }

    #[tokio::test]
    async fn test_huge_numbers_stay_numeric() {
        let store = store();
        store
            .create(
                CreateVariableRequest::new("$_big", VariableKind::Number)
                    .value("1")
                    .response_type(ResponseType::Inline),
            )
            .await
            .unwrap();

        let caps = viewer();
        let res = store.resolve("$_big", request(Some("1e300"), &caps)).await.unwrap().unwrap();
        assert_eq!(parse_number(&res.display), Some(1e300));

        let res = store.resolve("$_big", request(Some("+"), &caps)).await.unwrap().unwrap();
        assert_eq!(parse_number(&res.display), Some(1e300 + 1.0));

        store.resolve("$_big", request(Some("1.7e308"), &caps)).await.unwrap();
        let res = store
            .resolve("$_big", request(Some("+1.7e308"), &caps))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse_number(&res.display), Some(1.7e308));

        let stored = store.get("$_big").await.unwrap().current_value;
        assert_eq!(parse_number(&stored), Some(1.7e308));
        assert_eq!(store.history("$_big").len(), 3);
    }

    #[tokio::test]
    async fn test_read_only_is_never_mutated() {
        let store = store();
        store
            .create(
                CreateVariableRequest::new("$_title", VariableKind::Text)
                    .value("fixed")
                    .read_only(),
            )
            .await
            .unwrap();

        let caps = moderator();
        let res = store
            .resolve("$_title", request(Some("changed"), &caps))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.display, "fixed");
        assert!(res.notification.is_none());
        assert_eq!(store.get("$_title").await.unwrap().current_value, "fixed");
        assert!(store.history("$_title").is_empty());
    }

    #[tokio::test]
    async fn test_read_only_number_ignores_every_operand() {
        let store = store();
        store
            .create(
                CreateVariableRequest::new("$_deaths", VariableKind::Number)
                    .value("3")
                    .read_only(),
            )
            .await
            .unwrap();

        let mut caster = moderator();
        caster.tier = PermissionTier::Caster;
        caster.is_caster = true;

        for caps in [moderator(), caster] {
            for operand in ["+", "-", "+5", "7"] {
                let res = store
                    .resolve("$_deaths", request(Some(operand), &caps))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(res.display, "3");
                assert!(res.notification.is_none());
            }
        }

        assert_eq!(store.get("$_deaths").await.unwrap().current_value, "3");
        assert!(store.history("$_deaths").is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_tier_rejected() {
        let store = store();
        store
            .create(
                CreateVariableRequest::new("$_topic", VariableKind::Text)
                    .value("old")
                    .permission(PermissionTier::Moderator),
            )
            .await
            .unwrap();

        let caps = viewer();
        let res = store.resolve("$_topic", request(Some("new"), &caps)).await.unwrap().unwrap();
        assert_eq!(res.display, "old");

        let caps = moderator();
        let res = store.resolve("$_topic", request(Some("new"), &caps)).await.unwrap().unwrap();
        assert_eq!(res.display, "old");
        assert_eq!(store.get("$_topic").await.unwrap().current_value, "new");
    }

    #[tokio::test]
    async fn test_announce_and_silent_notifications() {
        let store = store();
        store
            .create(CreateVariableRequest::new("$_game", VariableKind::Text).value("chess"))
            .await
            .unwrap();

        let caps = viewer();
        let res = store.resolve("$_game", request(Some("go"), &caps)).await.unwrap().unwrap();
        assert_eq!(res.display, "chess");
        let notification = res.notification.unwrap();
        assert_eq!(notification.text, "alice, $_game was set to go.");
        assert_eq!(notification.old_value, "chess");

        let silent = ResolveRequest {
            operand: Some("poker"),
            capabilities: &caps,
            silent: true,
        };
        let res = store.resolve("$_game", silent).await.unwrap().unwrap();
        assert!(res.notification.is_none());
        assert_eq!(store.get("$_game").await.unwrap().current_value, "poker");
    }

    #[tokio::test]
    async fn test_custom_notification_text() {
        let store = store();
        store
            .create(
                CreateVariableRequest::new("$_mood", VariableKind::Text)
                    .value("calm")
                    .response_type(ResponseType::Custom(
                        "{{old_value}} -> {{value}} by {{sender}}".to_string(),
                    )),
            )
            .await
            .unwrap();

        let caps = viewer();
        let res = store.resolve("$_mood", request(Some("hyped"), &caps)).await.unwrap().unwrap();
        assert_eq!(res.notification.unwrap().text, "calm -> hyped by alice");
    }

    #[tokio::test]
    async fn test_text_rejects_bare_sign_operands() {
        let store = store();
        store
            .create(CreateVariableRequest::new("$_note", VariableKind::Text).value("x"))
            .await
            .unwrap();

        let caps = viewer();
        store.resolve("$_note", request(Some("+"), &caps)).await.unwrap();
        assert_eq!(store.get("$_note").await.unwrap().current_value, "x");
    }

    #[tokio::test]
    async fn test_eval_variables_are_not_mutated() {
        let store = store();
        store
            .create(CreateVariableRequest::new("$_clock", VariableKind::Eval).value("now()"))
            .await
            .unwrap();

        let caps = moderator();
        let res = store.resolve("$_clock", request(Some("1"), &caps)).await.unwrap().unwrap();
        assert_eq!(res.display, "now()");
    }

    #[tokio::test]
    async fn test_admin_set_value_bypasses_read_only() {
        let store = store();
        store
            .create(
                CreateVariableRequest::new("$_wins", VariableKind::Number)
                    .value("1")
                    .read_only(),
            )
            .await
            .unwrap();

        let updated = store.set_value("$_wins", "4", "admin").await.unwrap();
        assert_eq!(updated.current_value, "4");
        assert!(matches!(
            store.set_value("$_wins", "four", "admin").await,
            Err(VariableError::InvalidValue(_))
        ));

        let history = store.history("$_wins");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].actor, "admin");
        assert_eq!(history[0].change.old_value, "1");
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = store();
        store
            .create(CreateVariableRequest::new("$_x", VariableKind::Number))
            .await
            .unwrap();

        let updated = store
            .update(
                "$_x",
                UpdateVariableRequest {
                    step: Some(10.0),
                    read_only: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.step, 10.0);
        assert!(updated.read_only);

        store.delete("$_x").await.unwrap();
        assert!(matches!(store.get("$_x").await, Err(VariableError::NotFound(_))));
        assert!(matches!(store.delete("$_x").await, Err(VariableError::NotFound(_))));
    }
}
