//! realtime-tail - follow a realtime change feed from the terminal
//!
//! # Usage
//!
//! ```bash
//! # All project changes
//! realtime-tail -u ws://localhost:4000/socket -t projects
//!
//! # New notifications of one user, plus a conversation's typing roster
//! realtime-tail -c realtime.toml -t notifications -f "user_id=eq.{user_id}" \
//!     --user u1 --typing c9
//! ```

use clap::Parser;
use serde_json::{json, Map, Value as JsonValue};

use realtime_sync::consumers::ChangeFeedOptions;
use realtime_sync::logging::init_logging;
use realtime_sync::{
    ChangeFeedConsumer, LifecycleHandlers, RealtimeConfig, RealtimeContext, TypingConsumer,
    UserIdentity,
};

mod args;

use args::Cli;

fn print_line(value: JsonValue) {
    println!("{}", value);
}

fn load_config(cli: &Cli) -> anyhow::Result<RealtimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RealtimeConfig::from_file(path)?,
        None => RealtimeConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(url) = &cli.url {
        config.transport.url = url.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.to_lowercase();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.to_lowercase();
    }
    config.finalize()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(
        &config.logging.level,
        &config.logging.format,
        Some(&config.logging.targets),
    )?;

    let ctx = RealtimeContext::from_config(&config)?;
    let display_name = cli.name.clone().unwrap_or_else(|| cli.user.clone());
    ctx.session()
        .sign_in(UserIdentity::new(cli.user.clone(), display_name));

    let mut options = ChangeFeedOptions::new(cli.table.clone())
        .schema(cli.schema.clone())
        .handlers(
            LifecycleHandlers::new()
                .on_state(|state| log::info!("feed {}", state))
                .on_degraded(|status| {
                    log::warn!(
                        "feed degraded after {} attempts: {}",
                        status.reconnect_attempts,
                        status.error.unwrap_or_default()
                    )
                }),
        );
    if let Some(filter) = &cli.filter {
        options = options.filter_template(filter.clone());
    }
    let feed = ChangeFeedConsumer::mount(&ctx, options, |op, row: Map<String, JsonValue>| {
        print_line(json!({ "op": op, "row": row }));
    })?;

    let typing = match &cli.typing {
        Some(conversation) => {
            let conversation_id = conversation.clone();
            Some(TypingConsumer::mount(&ctx, conversation.clone(), move |names| {
                print_line(json!({ "conversation": conversation_id, "typing": names }));
            })?)
        },
        None => None,
    };

    log::info!(
        "Following {}.{} as {} (Ctrl-C to stop)",
        cli.schema,
        cli.table,
        cli.user
    );
    tokio::signal::ctrl_c().await?;

    if let Some(typing) = &typing {
        typing.close();
    }
    feed.close();
    log::info!("Stopped; {} channel(s) left open", ctx.registry().live_count());
    Ok(())
}
