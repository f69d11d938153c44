//! Response engine: renders node trees against a `RenderContext`.
//!
//! Rendering is strictly left-to-right and depth-first. Nothing here returns
//! an error: unknown syntax degrades to literal text and collaborator failures
//! degrade to empty or fallback text.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::locale::value_to_text;
use crate::messaging::Sender;
use crate::metrics::{API_FETCH_FAILURES_TOTAL, FILTER_EVALUATIONS_TOTAL, RENDER_LATENCY};
use crate::moderation::Moderation;
use crate::users::UserDirectory;
use crate::variables::{format_number, parse_number, ResolveRequest, VariableStore};

use super::context::{RenderContext, RenderOutput};
use super::filters::{FilterArgs, FilterKind, FilterRegistry, RandomScope};
use super::math;
use super::parser::{parse, Node, NodeId, NodeTree};

/// Decimal places accepted by `toPercent` and `toFloat`
const MAX_DECIMALS: usize = 20;

pub struct ResponseEngine {
    config: EngineConfig,
    registry: Arc<FilterRegistry>,
    variables: Arc<VariableStore>,
    users: Arc<dyn UserDirectory>,
    moderation: Arc<dyn Moderation>,
    http: reqwest::Client,
}

impl ResponseEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<FilterRegistry>,
        variables: Arc<VariableStore>,
        users: Arc<dyn UserDirectory>,
        moderation: Arc<dyn Moderation>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.api_timeout_ms))
            .user_agent(config.api_user_agent.clone())
            .build()?;

        Ok(Self {
            config,
            registry,
            variables,
            users,
            moderation,
            http,
        })
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.variables
    }

    /// Parse and render a template.
    pub async fn render_template(&self, template: &str, ctx: &mut RenderContext) -> RenderOutput {
        let tree = parse(template);
        self.render(&tree, ctx).await
    }

    /// Render a parsed template. Notifications collected during the render
    /// move into the output.
    #[tracing::instrument(
        name = "template.render",
        skip_all,
        fields(sender = %ctx.sender.username, nodes = tree.len())
    )]
    pub async fn render(&self, tree: &NodeTree, ctx: &mut RenderContext) -> RenderOutput {
        let timer = RENDER_LATENCY.start_timer();
        let text = self.render_nodes(tree, tree.root(), ctx, 0).await;
        timer.observe_duration();

        RenderOutput {
            text,
            notifications: std::mem::take(&mut ctx.notifications),
        }
    }

    fn render_nodes<'a>(
        &'a self,
        tree: &'a NodeTree,
        ids: &'a [NodeId],
        ctx: &'a mut RenderContext,
        depth: usize,
    ) -> BoxFuture<'a, String> {
        async move {
            let mut text = String::new();
            for &id in ids {
                text.push_str(&self.render_node(tree, id, ctx, depth).await);
            }
            text
        }
        .boxed()
    }

    fn render_node<'a>(
        &'a self,
        tree: &'a NodeTree,
        id: NodeId,
        ctx: &'a mut RenderContext,
        depth: usize,
    ) -> BoxFuture<'a, String> {
        async move {
            match tree.node(id) {
                Node::Literal(text) => text.clone(),
                Node::Variable {
                    name,
                    silent,
                    persisted,
                    source,
                } => {
                    self.render_variable(name, *silent, *persisted, source, ctx)
                        .await
                }
                Node::Filter { segments, source } => {
                    if depth >= self.config.max_render_depth {
                        tracing::debug!(depth, "Render depth exceeded, keeping filter source");
                        return source.clone();
                    }
                    self.render_filter(tree, segments, source, ctx, depth + 1)
                        .await
                }
            }
        }
        .boxed()
    }

    async fn render_variable(
        &self,
        name: &str,
        silent: bool,
        persisted: bool,
        source: &str,
        ctx: &mut RenderContext,
    ) -> String {
        if !persisted {
            return match ctx.params.get(name) {
                Some(value) => value.clone(),
                None => {
                    tracing::debug!(param = %name, "Unknown template parameter");
                    source.to_string()
                }
            };
        }

        let request = ResolveRequest {
            operand: ctx.operand.as_deref(),
            capabilities: &ctx.capabilities,
            silent,
        };
        let resolved = self.variables.resolve(name, request).await;

        match resolved {
            Ok(Some(resolution)) => {
                if let Some(notification) = resolution.notification {
                    ctx.notifications.push(notification);
                }
                resolution.display
            }
            Ok(None) => {
                tracing::debug!(variable = %name, "Unknown custom variable");
                source.to_string()
            }
            Err(e) => {
                tracing::warn!(variable = %name, error = %e, "Failed to resolve custom variable");
                source.to_string()
            }
        }
    }

    async fn render_filter(
        &self,
        tree: &NodeTree,
        segments: &[Vec<NodeId>],
        source: &str,
        ctx: &mut RenderContext,
        depth: usize,
    ) -> String {
        let head: &[NodeId] = segments.first().map(Vec::as_slice).unwrap_or(&[]);

        if is_if(tree, head) {
            FILTER_EVALUATIONS_TOTAL.with_label_values(&["if"]).inc();
            return self.render_if(tree, segments, source, ctx, depth).await;
        }

        let name = self.render_nodes(tree, head, ctx, depth).await;
        let mut args = Vec::with_capacity(segments.len().saturating_sub(1));
        for segment in segments.iter().skip(1) {
            args.push(self.render_nodes(tree, segment, ctx, depth).await);
        }

        let kind = self.registry.classify(&name);
        FILTER_EVALUATIONS_TOTAL
            .with_label_values(&[kind.label()])
            .inc();

        self.evaluate(kind, FilterArgs { name, args }, ctx).await
    }

    async fn evaluate(&self, kind: FilterKind, args: FilterArgs, ctx: &mut RenderContext) -> String {
        match kind {
            FilterKind::If | FilterKind::Unknown => {
                tracing::debug!(filter = %args.name, "Unknown filter, keeping literal");
                fallback(&args)
            }
            FilterKind::RandomUser(scope) => self.random_user(scope).await,
            FilterKind::RandomNumber { min, max } => random_number(min, max).to_string(),
            FilterKind::RandomTrueOrFalse => random_bool().to_string(),
            FilterKind::Api => {
                let url = args.joined();
                let url = url.trim();
                match self.fetch(url).await {
                    Ok(value) => {
                        ctx.by_products.insert("api".to_string(), value);
                    }
                    Err(e) => {
                        API_FETCH_FAILURES_TOTAL.inc();
                        tracing::warn!(url = %url, error = %e, "api filter request failed");
                        ctx.by_products.remove("api");
                    }
                }
                String::new()
            }
            FilterKind::ByProduct { key, path } => ctx
                .by_products
                .get(&key)
                .map(|value| lookup_path(value, &path))
                .unwrap_or_default(),
            FilterKind::Math(expr) => {
                let expr = expr.unwrap_or_else(|| args.joined());
                match math::evaluate(&expr) {
                    Ok(value) => format_number(value),
                    Err(e) => {
                        tracing::debug!(expr = %expr, error = %e, "Invalid math expression");
                        fallback(&args)
                    }
                }
            }
            FilterKind::ToPercent => {
                format_scaled(&args.args, 0, 100.0).unwrap_or_else(|| fallback(&args))
            }
            FilterKind::ToFloat => {
                format_scaled(&args.args, 2, 1.0).unwrap_or_else(|| fallback(&args))
            }
            FilterKind::Custom(filter) => {
                let output = filter.evaluate(&args, ctx).await;
                if let Some(by_product) = output.by_product {
                    ctx.by_products
                        .insert(args.name.trim().to_string(), by_product);
                }
                output.text.unwrap_or_default()
            }
        }
    }

    /// Render exactly one branch of `(if <a> ==|!= <b>|<then>|<else>)`.
    async fn render_if(
        &self,
        tree: &NodeTree,
        segments: &[Vec<NodeId>],
        source: &str,
        ctx: &mut RenderContext,
        depth: usize,
    ) -> String {
        let head: &[NodeId] = segments.first().map(Vec::as_slice).unwrap_or(&[]);

        let mut left = String::new();
        let mut right = String::new();
        // Some(true) for `==`, Some(false) for `!=`
        let mut operator: Option<bool> = None;
        let mut quote: Option<char> = None;

        for (index, &id) in head.iter().enumerate() {
            match tree.node(id) {
                Node::Literal(text) => {
                    let text = if index == 0 { &text[2..] } else { text.as_str() };
                    let mut chars = text.chars().peekable();

                    while let Some(c) = chars.next() {
                        if operator.is_none() {
                            match quote {
                                Some(q) if c == q => quote = None,
                                Some(_) => {}
                                None if c == '\'' || c == '"' => quote = Some(c),
                                None if matches!(c, '=' | '!') && chars.peek() == Some(&'=') => {
                                    chars.next();
                                    operator = Some(c == '=');
                                    continue;
                                }
                                None => {}
                            }
                        }

                        if operator.is_some() {
                            right.push(c);
                        } else {
                            left.push(c);
                        }
                    }
                }
                _ => {
                    let rendered = self.render_node(tree, id, ctx, depth).await;
                    if operator.is_some() {
                        right.push_str(&rendered);
                    } else {
                        left.push_str(&rendered);
                    }
                }
            }
        }

        let Some(equals) = operator else {
            tracing::debug!(source = %source, "if filter without comparison, keeping literal");
            return source.to_string();
        };

        let matched = (strip_quotes(left.trim()) == strip_quotes(right.trim())) == equals;

        if matched {
            match segments.get(1) {
                Some(branch) => self.render_nodes(tree, branch, ctx, depth).await,
                None => String::new(),
            }
        } else {
            let mut parts = Vec::new();
            for branch in segments.iter().skip(2) {
                parts.push(self.render_nodes(tree, branch, ctx, depth).await);
            }
            parts.join("|")
        }
    }

    /// Uniform pick over the scope's users, excluding ignored ones.
    async fn random_user(&self, scope: RandomScope) -> String {
        let ids = self.users.list_user_ids(scope.user_filter()).await;

        let mut pool = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(user) = self.users.find_user(&id).await else {
                continue;
            };
            let sender = Sender::new(user.id, user.username);
            if !self.moderation.is_ignored(&sender).await {
                pool.push(sender.username);
            }
        }

        if pool.is_empty() {
            tracing::debug!(scope = ?scope, "No users to draw from");
            return self.config.unknown_user.clone();
        }

        let index = rand::rng().random_range(0..pool.len());
        pool.swap_remove(index)
    }

    async fn fetch(&self, url: &str) -> std::result::Result<Value, reqwest::Error> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

fn random_number(min: i64, max: i64) -> i64 {
    rand::rng().random_range(min..=max)
}

fn random_bool() -> bool {
    rand::rng().random_bool(0.5)
}

/// First head node is a literal `if` followed by whitespace or a quote
fn is_if(tree: &NodeTree, head: &[NodeId]) -> bool {
    match head.first().map(|&id| tree.node(id)) {
        Some(Node::Literal(text)) => text
            .strip_prefix("if")
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_whitespace() || c == '\'' || c == '"'),
        _ => false,
    }
}

fn strip_quotes(text: &str) -> &str {
    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return &text[1..text.len() - 1];
        }
    }
    text
}

/// Literal rendering of a filter the engine cannot evaluate
fn fallback(args: &FilterArgs) -> String {
    let mut text = String::from("(");
    text.push_str(&args.name);
    for arg in &args.args {
        text.push('|');
        text.push_str(arg);
    }
    text.push(')');
    text
}

/// `[decimals|]number`, scaled and formatted with fixed decimals
fn format_scaled(args: &[String], default_decimals: usize, factor: f64) -> Option<String> {
    let (decimals, number) = match args {
        [number] => (default_decimals, number),
        [decimals, number] => (
            decimals
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|d| *d <= MAX_DECIMALS)?,
            number,
        ),
        _ => return None,
    };

    let value = parse_number(number)?;
    Some(format!("{:.*}", decimals, value * factor))
}

/// Dotted path lookup. Numeric segments index arrays; `_response` is the
/// raw stored body.
fn lookup_path(value: &Value, path: &str) -> String {
    if path == "_response" {
        return match value {
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
    }

    let mut current = value;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return String::new(),
        }
    }

    value_to_text(current)
}
