//! Hello Bot Example
//!
//! A greeter built on the ibots runtime. It introduces itself once, comments
//! on every new post by someone else and thanks visitors who comment on its
//! introduction. Every greeting is recorded in a shared, budgeted `ledger`
//! resource.
//!
//! Crash safety comes from the checkpoint: the introduction's id and every
//! greeting's reply live in the bot state, keyed by the entry they answer.
//! A redelivered post or comment is never answered twice, whether it comes
//! back after a failed batch or after a restart.
//!
//! # Usage
//!
//! ```bash
//! # Against the configured platform
//! cargo run --package hello-bot -- --config demos/hello_bot/ibots.toml
//!
//! # Against an in-memory platform with a simulated visitor
//! cargo run --package hello-bot -- --config demos/hello_bot/ibots.toml --offline
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ibots::core::{ApiClient, Credentials, RetryConfig};
use ibots::prelude::*;
use ibots::runtime::config::ConfigLoader;
use ibots::runtime::logging;
use ibots::transport::MemoryPlatform;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

const VISITOR: &str = "visitor";
const VISITOR_PASSWORD: &str = "visitor";

#[derive(Parser, Debug)]
#[command(name = "hello-bot", about = "Greets newcomers on the platform")]
struct Cli {
    /// Configuration file. Defaults to ibots.toml in the working directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration profile (development, production or a custom name).
    #[arg(short, long)]
    profile: Option<String>,

    /// Run against an in-memory platform with a simulated visitor.
    #[arg(long)]
    offline: bool,
}

// ============================================================================
// Handler
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HelloArgs {
    greeting: String,
}

impl Default for HelloArgs {
    fn default() -> Self {
        Self {
            greeting: "Welcome".to_string(),
        }
    }
}

struct HelloBot {
    greeting: String,
}

impl HelloBot {
    async fn display_name(ctx: &BotContext, author: &Bid) -> HandlerResult<String> {
        Ok(ctx
            .api()
            .fetch_user(author)
            .await?
            .map(|user| user.short_name().to_string())
            .unwrap_or_else(|| "friend".to_string()))
    }
}

impl ConfigurableHandler for HelloBot {
    type Args = HelloArgs;

    fn name() -> &'static str {
        "hello"
    }

    fn from_args(args: Self::Args) -> HandlerResult<Self> {
        Ok(Self {
            greeting: args.greeting,
        })
    }
}

#[async_trait]
impl BotHandler for HelloBot {
    fn interests(&self) -> Vec<EntryKind> {
        vec![EntryKind::Post, EntryKind::Comment]
    }

    async fn on_start(&mut self, ctx: &mut BotContext) -> HandlerResult {
        if let Some(greeting) = ctx.get_state::<String>("greeting") {
            self.greeting = greeting;
        }
        if ctx.get_state::<Bid>("intro").is_some() {
            return Ok(());
        }

        let intro = ctx
            .api()
            .post(
                "Hello!",
                format!("{}! I say hi to every new post.", self.greeting),
            )
            .await?;
        info!(bot_id = %ctx.bot_id(), post = %intro, "Posted introduction");
        ctx.set_state("intro", &intro)
    }

    async fn on_post(&mut self, ctx: &mut BotContext, entry: &Entry) -> HandlerResult {
        if &entry.author == ctx.identity() {
            return Ok(());
        }

        let key = format!("greeted:{}", entry.bid);
        if ctx.get_state::<Bid>(&key).is_some() {
            return Ok(());
        }

        let name = Self::display_name(ctx, &entry.author).await?;
        let reply = ctx
            .api()
            .comment(&entry.bid, format!("{}, {name}!", self.greeting))
            .await?;
        ctx.set_state(&key, &reply)?;
        let greeted = ctx
            .invoke("ledger", "record", json!({ "bot": ctx.bot_id() }))
            .await?;
        info!(post = %entry.bid, greeted = %greeted, "Greeted new post");
        Ok(())
    }

    async fn on_comment(&mut self, ctx: &mut BotContext, entry: &Entry) -> HandlerResult {
        let Some(intro) = ctx.get_state::<Bid>("intro") else {
            return Ok(());
        };
        if entry.parent() != Some(&intro) || &entry.author == ctx.identity() {
            return Ok(());
        }

        let key = format!("thanked:{}", entry.bid);
        if ctx.get_state::<Bid>(&key).is_some() {
            return Ok(());
        }

        let name = Self::display_name(ctx, &entry.author).await?;
        let reply = ctx
            .api()
            .comment(&intro, format!("Thanks for stopping by, {name}!"))
            .await?;
        ctx.set_state(&key, &reply)
    }

    async fn on_command(&mut self, ctx: &mut BotContext, instruction: &str) -> HandlerResult {
        match instruction.split_once(' ') {
            Some(("greeting", text)) if !text.trim().is_empty() => {
                self.greeting = text.trim().to_string();
                info!(greeting = %self.greeting, "Greeting changed");
                ctx.set_state("greeting", &self.greeting)
            }
            _ => {
                warn!(instruction, "Unknown command");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Ledger resource
// ============================================================================

/// Counts greetings per bot.
struct Ledger {
    name: String,
    greetings: BTreeMap<String, u64>,
}

impl ConfigurableResource for Ledger {
    type Args = Value;

    fn kind() -> &'static str {
        "ledger"
    }

    fn from_args(name: &str, _args: Self::Args) -> ResourceResult<Self> {
        Ok(Self {
            name: name.to_string(),
            greetings: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl Resource for Ledger {
    async fn invoke(&mut self, operation: &str, args: Value) -> ResourceResult<Value> {
        match operation {
            "record" => {
                let bot = args
                    .get("bot")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ResourceError::failed(&self.name, "missing 'bot'"))?;
                let count = self.greetings.entry(bot.to_string()).or_default();
                *count += 1;
                Ok(json!(*count))
            }
            "totals" => Ok(json!(self.greetings)),
            _ => Err(ResourceError::unsupported(&self.name, operation)),
        }
    }

    async fn command(&mut self, instruction: &str) -> ResourceResult<Value> {
        match instruction {
            "totals" => Ok(json!(self.greetings)),
            "reset" => {
                self.greetings.clear();
                Ok(Value::Null)
            }
            _ => Err(ResourceError::unsupported(&self.name, instruction)),
        }
    }
}

// ============================================================================
// Offline platform
// ============================================================================

fn offline_platform(config: &IbotsConfig) -> MemoryPlatform {
    let platform = MemoryPlatform::new();
    platform.set_clock(Timestamp::now());
    for bot in config.bots.values() {
        platform.add_user(UserKind::Person, &bot.username, &bot.password, &bot.username, Cents(0));
    }
    platform.add_user(
        UserKind::Person,
        VISITOR,
        VISITOR_PASSWORD,
        "Avery Visitor",
        Cents(10_000),
    );
    platform
}

/// Posts something every few seconds as the visitor.
async fn visit(platform: MemoryPlatform) {
    let credentials = Credentials::new(VISITOR, VISITOR_PASSWORD);
    let client = match ApiClient::connect(&platform, &credentials, RetryConfig::default()).await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Visitor failed to log in");
            return;
        }
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    for n in 1.. {
        ticker.tick().await;
        if let Err(e) = client
            .post(format!("Visitor post #{n}"), "Just passing through.")
            .await
        {
            warn!(error = %e, "Visitor failed to post");
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.file(path);
    }
    if let Some(profile) = &cli.profile {
        loader = loader.profile(profile);
    }
    let mut config = loader.load()?;
    logging::init_from_config(&config.logging);

    let orchestrator = if cli.offline {
        config.global.state_dir = config.global.state_dir.join("offline");
        let platform = offline_platform(&config);
        tokio::spawn(visit(platform.clone()));
        Orchestrator::new(config, Arc::new(platform))?
    } else {
        Orchestrator::from_config(config)?
    };

    orchestrator
        .register_handler::<HelloBot>()
        .register_resource::<Ledger>();

    orchestrator.run().await?;

    for status in orchestrator.status() {
        info!(
            bot_id = %status.bot_id,
            state = %status.state,
            dispatched = status.dispatched,
            restarts = status.restarts,
            "Final status"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibots::core::{BotState, ResourceManager, ResourcePolicy};

    struct Fixture {
        platform: MemoryPlatform,
        resources: ResourceManager,
        visitor: ApiClient,
    }

    impl Fixture {
        async fn new() -> Self {
            let platform = MemoryPlatform::new();
            platform.add_user(UserKind::Person, "greeter", "pw", "Greeter", Cents(0));
            platform.add_user(
                UserKind::Person,
                VISITOR,
                VISITOR_PASSWORD,
                "Avery Visitor",
                Cents(0),
            );
            let ledger = Ledger::from_args("ledger", Value::Null).unwrap();
            let resources = ResourceManager::new();
            resources
                .register("ledger", Box::new(ledger), ResourcePolicy::default())
                .unwrap();
            let visitor = ApiClient::connect(
                &platform,
                &Credentials::new(VISITOR, VISITOR_PASSWORD),
                RetryConfig::default(),
            )
            .await
            .unwrap();
            Self { platform, resources, visitor }
        }

        async fn context(&self) -> BotContext {
            let credentials = Credentials::new("greeter", "pw");
            let api = ApiClient::connect(&self.platform, &credentials, RetryConfig::default())
                .await
                .unwrap();
            let grants = vec!["ledger".to_string()];
            let resources = self.resources.acquire_all("greeter", &grants).unwrap();
            BotContext::new("greeter", api, resources, BotState::new())
        }

        fn entry(&self, bid: &Bid) -> Entry {
            self.platform
                .entries()
                .into_iter()
                .find(|e| &e.bid == bid)
                .unwrap()
        }

        fn replies_to(&self, parent: &Bid) -> usize {
            self.platform
                .entries()
                .iter()
                .filter(|e| e.parent() == Some(parent))
                .count()
        }
    }

    #[tokio::test]
    async fn test_redelivered_post_is_greeted_once() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context().await;
        let mut bot = HelloBot::from_args(HelloArgs::default()).unwrap();

        let post = fixture.visitor.post("Hi", "First time here").await.unwrap();
        let entry = fixture.entry(&post);

        bot.on_post(&mut ctx, &entry).await.unwrap();
        bot.on_post(&mut ctx, &entry).await.unwrap();

        assert_eq!(fixture.replies_to(&post), 1);
        assert!(ctx.get_state::<Bid>(&format!("greeted:{post}")).is_some());
        let totals = fixture.resources.command("ledger", "totals").await.unwrap();
        assert_eq!(totals, json!({ "greeter": 1 }));
    }

    #[tokio::test]
    async fn test_redelivered_comment_is_thanked_once() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context().await;
        let mut bot = HelloBot::from_args(HelloArgs::default()).unwrap();
        bot.on_start(&mut ctx).await.unwrap();
        let intro = ctx.get_state::<Bid>("intro").unwrap();

        let comment = fixture.visitor.comment(&intro, "Nice to meet you").await.unwrap();
        let entry = fixture.entry(&comment);

        bot.on_comment(&mut ctx, &entry).await.unwrap();
        bot.on_comment(&mut ctx, &entry).await.unwrap();

        // The visitor's comment plus one thank-you.
        assert_eq!(fixture.replies_to(&intro), 2);
    }
}
