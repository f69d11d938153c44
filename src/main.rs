use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinSet;

use ara_chat_engine::config::Settings;
use ara_chat_engine::dispatch::{CommandRegistry, Dispatcher};
use ara_chat_engine::handlers::{CustomCommands, CustomResponse, MemoryPointsLedger, PriceGate};
use ara_chat_engine::locale::StaticTranslator;
use ara_chat_engine::messaging::{ChatMessage, MessageSink, OutboundMessage, Sender};
use ara_chat_engine::moderation::BasicModeration;
use ara_chat_engine::permission::PermissionResolver;
use ara_chat_engine::telemetry::init_telemetry;
use ara_chat_engine::template::{FilterRegistry, ResponseEngine};
use ara_chat_engine::users::{MemoryUserDirectory, UserDirectory, UserRecord};
use ara_chat_engine::variables::create_variable_store;

/// Points every new chatter starts with
const STARTING_POINTS: i64 = 100;

/// Prints delivered messages
struct StdoutSink;

#[async_trait]
impl MessageSink for StdoutSink {
    async fn deliver(&self, message: OutboundMessage) {
        match message.attrs.get("kind") {
            Some(kind) => println!("[{}] {}", kind, message.text),
            None => println!("{}", message.text),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Flushes pending spans on drop
    let _telemetry = init_telemetry(&settings.telemetry)?;
    tracing::info!("Configuration loaded");

    let users = Arc::new(MemoryUserDirectory::new());
    let moderation = Arc::new(BasicModeration::new());
    let translator = Arc::new(StaticTranslator::new());
    let variables = create_variable_store(&settings.variables);

    let engine = Arc::new(ResponseEngine::new(
        settings.engine.clone(),
        Arc::new(FilterRegistry::new()),
        variables,
        users.clone(),
        moderation.clone(),
    )?);

    let ledger = Arc::new(MemoryPointsLedger::default());
    let price = Arc::new(PriceGate::new(ledger.clone(), translator.clone()));
    price.set_price("!hug", 10);

    let custom = Arc::new(CustomCommands::new(translator));
    custom.create(
        "!hug",
        vec![CustomResponse::new("$sender hugs $touser (random.number-1-to-100)% hard!")],
    )?;
    custom.create(
        "!points",
        vec![CustomResponse::new("$sender, try !hug for 10 points")],
    )?;

    let mut registry = CommandRegistry::new();
    registry.register(price.registration());
    registry.register(custom.registration());

    let permissions = Arc::new(PermissionResolver::new(
        users.clone(),
        &settings.permissions.owners,
    ));

    let (dispatcher, _worker) = Dispatcher::new(
        Arc::new(registry),
        engine,
        permissions,
        moderation,
        Arc::new(StdoutSink),
    );
    let dispatcher = Arc::new(dispatcher);
    tracing::info!("Dispatcher ready, reading `username: message` lines from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
        };

        let Some(line) = line else {
            break;
        };

        let Some((username, text)) = line.split_once(':') else {
            tracing::warn!(line = %line, "Expected `username: message`");
            continue;
        };

        let username = username.trim();
        let user_id = username.to_lowercase();
        if users.find_user(&user_id).await.is_none() {
            users.upsert(UserRecord::new(user_id.clone(), username).online());
            ledger.set_balance(&user_id, STARTING_POINTS);
        }

        let message = ChatMessage::new(Sender::new(user_id, username), text.trim());
        let dispatcher = dispatcher.clone();
        in_flight.spawn(async move { dispatcher.dispatch(message).await });
    }

    // Wait for in-flight dispatches to finish
    while let Some(result) = in_flight.join_next().await {
        match result {
            Ok(outcome) => tracing::debug!(
                dispatch_id = %outcome.id,
                state = outcome.state.as_str(),
                "Dispatch completed"
            ),
            Err(e) => tracing::error!(error = %e, "Dispatch task failed"),
        }
    }

    let stats = dispatcher.stats();
    tracing::info!(
        dispatched = stats.total_dispatched,
        delivered = stats.total_delivered,
        vetoed = stats.total_vetoed,
        rolled_back = stats.total_rolled_back,
        "Shutdown complete"
    );
    Ok(())
}
