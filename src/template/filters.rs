//! Filter registry.
//!
//! Built-in filters are a closed set keyed by the first dotted segment of the
//! filter name. Custom filters are trait objects registered at startup under
//! their full name; the registry is then frozen behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::users::UserFilter;

use super::context::RenderContext;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Filter name clashes with built-in filter: {0}")]
    BuiltinClash(String),

    #[error("Filter already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Invalid filter name: {0}")]
    InvalidName(String),
}

/// Arguments passed to a custom filter, already rendered
#[derive(Debug, Clone, PartialEq)]
pub struct FilterArgs {
    /// Rendered name region
    pub name: String,
    /// Rendered `|`-separated arguments
    pub args: Vec<String>,
}

impl FilterArgs {
    /// All arguments joined back with `|`
    pub fn joined(&self) -> String {
        self.args.join("|")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutput {
    /// Replacement text, `None` for side-effect-only filters
    pub text: Option<String>,
    /// Stored under the filter name for `(<name>.<path>)` lookups
    pub by_product: Option<Value>,
}

impl FilterOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            by_product: None,
        }
    }

    pub fn by_product(value: Value) -> Self {
        Self {
            text: None,
            by_product: Some(value),
        }
    }
}

#[async_trait]
pub trait Filter: Send + Sync {
    async fn evaluate(&self, args: &FilterArgs, ctx: &RenderContext) -> FilterOutput;
}

/// Pool a `random.<scope>` draw picks from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomScope {
    Viewer,
    OnlineViewer,
    Follower,
    OnlineFollower,
    Subscriber,
    OnlineSubscriber,
}

impl RandomScope {
    pub fn user_filter(self) -> UserFilter {
        let (online_only, followers_only, subscribers_only) = match self {
            Self::Viewer => (false, false, false),
            Self::OnlineViewer => (true, false, false),
            Self::Follower => (false, true, false),
            Self::OnlineFollower => (true, true, false),
            Self::Subscriber => (false, false, true),
            Self::OnlineSubscriber => (true, false, true),
        };

        UserFilter {
            online_only,
            followers_only,
            subscribers_only,
        }
    }
}

#[derive(Clone)]
pub enum FilterKind {
    If,
    RandomUser(RandomScope),
    RandomNumber { min: i64, max: i64 },
    RandomTrueOrFalse,
    /// `api|<url>`
    Api,
    /// `<key>.<path>` lookup into a stored by-product
    ByProduct { key: String, path: String },
    /// `math.<expr>`, or `math|<expr>` when `None`
    Math(Option<String>),
    ToPercent,
    ToFloat,
    Custom(Arc<dyn Filter>),
    Unknown,
}

impl FilterKind {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Self::If => "if",
            Self::RandomUser(_) => "random_user",
            Self::RandomNumber { .. } => "random_number",
            Self::RandomTrueOrFalse => "random_true_or_false",
            Self::Api => "api",
            Self::ByProduct { .. } => "by_product",
            Self::Math(_) => "math",
            Self::ToPercent => "to_percent",
            Self::ToFloat => "to_float",
            Self::Custom(_) => "custom",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Debug for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RandomUser(scope) => f.debug_tuple("RandomUser").field(scope).finish(),
            Self::RandomNumber { min, max } => f
                .debug_struct("RandomNumber")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::ByProduct { key, path } => f
                .debug_struct("ByProduct")
                .field("key", key)
                .field("path", path)
                .finish(),
            Self::Math(expr) => f.debug_tuple("Math").field(expr).finish(),
            other => f.write_str(other.label()),
        }
    }
}

type Classifier = fn(&str) -> Option<FilterKind>;

pub struct FilterRegistry {
    builtins: HashMap<&'static str, Classifier>,
    custom: HashMap<String, Arc<dyn Filter>>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut builtins: HashMap<&'static str, Classifier> = HashMap::new();
        builtins.insert("if", classify_if);
        builtins.insert("random", classify_random);
        builtins.insert("api", classify_api);
        builtins.insert("math", classify_math);
        builtins.insert("toPercent", classify_to_percent);
        builtins.insert("toFloat", classify_to_float);

        Self {
            builtins,
            custom: HashMap::new(),
        }
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom filter under its full name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        filter: Arc<dyn Filter>,
    ) -> Result<(), RegistryError> {
        let name = name.into();

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(RegistryError::InvalidName(name));
        }
        if self.builtins.contains_key(first_segment(&name)) {
            return Err(RegistryError::BuiltinClash(name));
        }
        if self.custom.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }

        tracing::info!(filter = %name, "Custom filter registered");
        self.custom.insert(name, filter);
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.custom.contains_key(name) || self.builtins.contains_key(first_segment(name))
    }

    /// Classify a rendered filter name.
    pub fn classify(&self, name: &str) -> FilterKind {
        let name = name.trim();

        if let Some(kind) = self
            .builtins
            .get(first_segment(name))
            .and_then(|classify| classify(name))
        {
            return kind;
        }

        if let Some(filter) = self.custom.get(name) {
            return FilterKind::Custom(filter.clone());
        }

        // `<custom>.<path>` reads that filter's by-product
        if let Some((key, path)) = name.split_once('.') {
            if self.custom.contains_key(key) && !path.is_empty() {
                return FilterKind::ByProduct {
                    key: key.to_string(),
                    path: path.to_string(),
                };
            }
        }

        FilterKind::Unknown
    }
}

fn first_segment(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

fn classify_if(name: &str) -> Option<FilterKind> {
    (name == "if").then_some(FilterKind::If)
}

fn classify_random(name: &str) -> Option<FilterKind> {
    let rest = name.strip_prefix("random.")?;

    let scope = match rest {
        "viewer" => Some(RandomScope::Viewer),
        "online.viewer" => Some(RandomScope::OnlineViewer),
        "follower" => Some(RandomScope::Follower),
        "online.follower" => Some(RandomScope::OnlineFollower),
        "subscriber" => Some(RandomScope::Subscriber),
        "online.subscriber" => Some(RandomScope::OnlineSubscriber),
        _ => None,
    };
    if let Some(scope) = scope {
        return Some(FilterKind::RandomUser(scope));
    }

    if rest == "true-or-false" {
        return Some(FilterKind::RandomTrueOrFalse);
    }

    let (min, max) = rest.strip_prefix("number-")?.split_once("-to-")?;
    let min: i64 = min.trim().parse().ok()?;
    let max: i64 = max.trim().parse().ok()?;
    Some(FilterKind::RandomNumber {
        min: min.min(max),
        max: min.max(max),
    })
}

fn classify_api(name: &str) -> Option<FilterKind> {
    if name == "api" {
        return Some(FilterKind::Api);
    }
    let path = name.strip_prefix("api.")?;
    (!path.is_empty()).then(|| FilterKind::ByProduct {
        key: "api".to_string(),
        path: path.to_string(),
    })
}

fn classify_math(name: &str) -> Option<FilterKind> {
    if name == "math" {
        return Some(FilterKind::Math(None));
    }
    name.strip_prefix("math.")
        .map(|expr| FilterKind::Math(Some(expr.to_string())))
}

fn classify_to_percent(name: &str) -> Option<FilterKind> {
    (name == "toPercent").then_some(FilterKind::ToPercent)
}

fn classify_to_float(name: &str) -> Option<FilterKind> {
    (name == "toFloat").then_some(FilterKind::ToFloat)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Filter for Upper {
        async fn evaluate(&self, args: &FilterArgs, _ctx: &RenderContext) -> FilterOutput {
            FilterOutput::text(args.joined().to_uppercase())
        }
    }

    #[test]
    fn test_classify_builtins() {
        let registry = FilterRegistry::new();

        assert!(matches!(registry.classify("if"), FilterKind::If));
        assert!(matches!(
            registry.classify("random.online.subscriber"),
            FilterKind::RandomUser(RandomScope::OnlineSubscriber)
        ));
        assert!(matches!(registry.classify("random.true-or-false"), FilterKind::RandomTrueOrFalse));
        assert!(matches!(registry.classify("api"), FilterKind::Api));
        assert!(matches!(
            registry.classify("api.data.0.name"),
            FilterKind::ByProduct { ref key, ref path } if key == "api" && path == "data.0.name"
        ));
        assert!(matches!(registry.classify("math"), FilterKind::Math(None)));
        assert!(matches!(
            registry.classify("math.1+2"),
            FilterKind::Math(Some(ref expr)) if expr == "1+2"
        ));
        assert!(matches!(registry.classify("toPercent"), FilterKind::ToPercent));
        assert!(matches!(registry.classify("toFloat"), FilterKind::ToFloat));
    }

    #[test]
    fn test_random_number_bounds() {
        let registry = FilterRegistry::new();
        assert!(matches!(
            registry.classify("random.number-10-to-1"),
            FilterKind::RandomNumber { min: 1, max: 10 }
        ));
        assert!(matches!(
            registry.classify("random.number--5-to-5"),
            FilterKind::RandomNumber { min: -5, max: 5 }
        ));
        assert!(matches!(registry.classify("random.number-a-to-b"), FilterKind::Unknown));
    }

    #[test]
    fn test_unknown_names() {
        let registry = FilterRegistry::new();
        assert!(matches!(registry.classify("random.nobody"), FilterKind::Unknown));
        assert!(matches!(registry.classify("hello world"), FilterKind::Unknown));
        assert!(matches!(registry.classify("ifx"), FilterKind::Unknown));
    }

    #[test]
    fn test_register_custom() {
        let mut registry = FilterRegistry::new();
        registry.register("shout", Arc::new(Upper)).unwrap();

        assert!(matches!(registry.classify("shout"), FilterKind::Custom(_)));
        assert!(matches!(
            registry.classify("shout.last"),
            FilterKind::ByProduct { ref key, .. } if key == "shout"
        ));
        assert_eq!(
            registry.register("shout", Arc::new(Upper)),
            Err(RegistryError::AlreadyRegistered("shout".to_string()))
        );
    }

    #[test]
    fn test_register_rejects_builtin_names() {
        let mut registry = FilterRegistry::new();
        assert_eq!(
            registry.register("math.double", Arc::new(Upper)),
            Err(RegistryError::BuiltinClash("math.double".to_string()))
        );
        assert_eq!(
            registry.register("api", Arc::new(Upper)),
            Err(RegistryError::BuiltinClash("api".to_string()))
        );
        assert!(matches!(
            registry.register("bad name", Arc::new(Upper)),
            Err(RegistryError::InvalidName(_))
        ));
    }
}
