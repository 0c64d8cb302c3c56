use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay::cache::TieredCache;
use relay::config::{self, Config};
use relay::jobs::{batch_update, channel_sync};
use relay::models::channel::{parse_models, Channel, ChannelConfig, ChannelStatus, ProviderKind};
use relay::models::token::{generate_key, Token, TokenStatus};
use relay::models::user::User;
use relay::notification::webhook::WebhookNotifier;
use relay::notification::{LogNotifier, Notifier};
use relay::proxy::adapter::AdapterRegistry;
use relay::proxy::upstream::UpstreamClient;
use relay::store::postgres::PgStore;
use relay::store::{admin, expand_multi_key, AdminStore, ChannelQuery, Page, RelayStore};
use relay::AppState;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export is opt-in. A broken collector config only costs us spans.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let installed = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "relay-gateway"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio);
        match installed {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(e) => {
                eprintln!("failed to install OpenTelemetry tracer: {}", e);
                None
            }
        }
    } else {
        None
    };

    let json_logs = std::env::var("RELAY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "relay=debug,relayd=debug,tower_http=debug".into()),
        ))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Token { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_token_command(&db, &cfg, command).await
        }
        Some(cli::Commands::Channel { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_channel_command(&db, command).await
        }
        Some(cli::Commands::User { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_user_command(&db, &cfg, command).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    opentelemetry::global::shutdown_tracer_provider();

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;
    let store: Arc<dyn RelayStore> = Arc::new(db);

    let cache = match &cfg.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            let client = redis::Client::open(url.as_str())?;
            let conn = redis::aio::ConnectionManager::new(client)
                .await
                .context("failed to connect to Redis")?;
            TieredCache::new(Some(conn))
        }
        None => {
            tracing::info!("REDIS_URL not set, using in-process cache only");
            TieredCache::in_memory()
        }
    };

    let notifier: Arc<dyn Notifier> = match &cfg.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            cfg.notify_webhook_secret.clone(),
        )?),
        None => Arc::new(LogNotifier),
    };

    let sync_every = Duration::from_secs(cfg.sync_frequency_secs.max(1));
    let state = Arc::new(AppState::new(
        cfg,
        store.clone(),
        cache.clone(),
        notifier,
        UpstreamClient::new()?,
    )?);

    let loaded = channel_sync::sync_once(store.as_ref(), &state.channels).await?;
    tracing::info!(channels = loaded, "channel index loaded");
    channel_sync::spawn(store, state.channels.clone(), cache, sync_every);

    if let Some(batch) = &state.batch {
        batch_update::spawn(batch.clone(), state.config.batch_update_interval());
        tracing::info!(
            interval_secs = state.config.batch_update_interval_secs,
            "batch quota updates enabled"
        );
    }

    let app = relay::app(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("relay gateway listening on {}", addr);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Deltas still in the accumulator would otherwise be lost.
    if let Some(batch) = &state.batch {
        let report = batch.flush().await;
        tracing::info!(
            applied = report.applied,
            requeued = report.requeued,
            "final batch flush"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn handle_token_command(
    db: &PgStore,
    cfg: &Config,
    cmd: cli::TokenCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Create {
            user_id,
            name,
            quota,
            unlimited,
            expires_in_days,
        } => {
            if db.get_user(user_id).await?.is_none() {
                anyhow::bail!("user {} not found", user_id);
            }
            let mut token = Token::new(user_id, name, generate_key(), quota);
            token.unlimited_quota = unlimited;
            token.remind_threshold = cfg.quota_remind_threshold;
            token.expired_time = admin::expiry_in_days(expires_in_days);
            let id = db.insert_token(&token).await?;
            println!(
                "Token created:\n  ID:  {}\n  Use: Authorization: Bearer {}",
                id, token.key
            );
        }
        cli::TokenCommands::List {
            user_id,
            keyword,
            page,
        } => {
            let tokens = db
                .search_tokens(user_id, &keyword, Page { page, ..Page::default() })
                .await?;
            if tokens.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<8} {:<20} {:<10} {:>14} {:>14}",
                    "ID", "NAME", "STATUS", "REMAINING", "USED"
                );
                for t in tokens {
                    let remaining = if t.unlimited_quota {
                        "unlimited".to_string()
                    } else {
                        display_quota(t.remain_quota, cfg.quota_per_unit)
                    };
                    println!(
                        "{:<8} {:<20} {:<10} {:>14} {:>14}",
                        t.id,
                        t.name,
                        format!("{:?}", t.status),
                        remaining,
                        display_quota(t.used_quota, cfg.quota_per_unit)
                    );
                }
            }
        }
        cli::TokenCommands::Update {
            user_id,
            id,
            name,
            quota,
            unlimited,
            expires_in_days,
            never_expires,
            remind_threshold,
            status,
        } => {
            let expired_time = if never_expires {
                Some(admin::expiry_in_days(None))
            } else {
                expires_in_days.map(|d| admin::expiry_in_days(Some(d)))
            };
            let update = admin::TokenUpdate {
                name,
                remain_quota: quota,
                unlimited_quota: unlimited,
                expired_time,
                remind_threshold,
                status: status.map(|s| match s {
                    cli::TokenStatusArg::Enabled => TokenStatus::Enabled,
                    cli::TokenStatusArg::Disabled => TokenStatus::Disabled,
                }),
            };
            let token = admin::update_token(db, user_id, id, update).await?;
            println!("Token {} updated: status {:?}", token.id, token.status);
        }
        cli::TokenCommands::Delete { user_id, ids } => {
            let deleted = db.delete_tokens(user_id, &ids).await?;
            println!("Deleted {} token(s).", deleted);
        }
    }
    Ok(())
}

async fn handle_channel_command(db: &PgStore, cmd: cli::ChannelCommands) -> anyhow::Result<()> {
    match cmd {
        cli::ChannelCommands::Add {
            name,
            provider,
            keys,
            base_url,
            models,
            model_mapping,
            priority,
            weight,
            region,
            api_version,
        } => {
            let provider: ProviderKind = provider.parse().map_err(anyhow::Error::msg)?;
            let models = match models {
                Some(raw) => parse_models(&raw),
                None => AdapterRegistry::new(UpstreamClient::new()?)
                    .get(provider)?
                    .list_models(),
            };
            if models.is_empty() {
                anyhow::bail!("--models must name at least one model");
            }
            let model_mapping = match model_mapping {
                Some(raw) => serde_json::from_str(&raw).context("--model-mapping must be a JSON object")?,
                None => Default::default(),
            };
            let template = Channel {
                id: 0,
                name,
                provider,
                key: keys.join("\n"),
                base_url,
                models,
                model_mapping,
                priority,
                weight,
                status: ChannelStatus::Enabled,
                config: ChannelConfig { region, api_version },
            };
            let ids = db.insert_channels(&expand_multi_key(&template)).await?;
            println!("Created {} channel(s): {:?}", ids.len(), ids);
        }
        cli::ChannelCommands::List {
            keyword,
            status,
            page,
        } => {
            let query = ChannelQuery {
                keyword,
                status: status.map(|s| match s {
                    cli::StatusFilter::Enabled => ChannelStatus::Enabled,
                    cli::StatusFilter::Disabled => ChannelStatus::ManuallyDisabled,
                    cli::StatusFilter::AutoDisabled => ChannelStatus::AutoDisabled,
                }),
            };
            let channels = db
                .search_channels(&query, Page { page, ..Page::default() })
                .await?;
            if channels.is_empty() {
                println!("No channels found.");
            } else {
                println!(
                    "{:<6} {:<20} {:<10} {:<18} {:>8} {:>6}  MODELS",
                    "ID", "NAME", "PROVIDER", "STATUS", "PRIORITY", "WEIGHT"
                );
                for c in channels {
                    println!(
                        "{:<6} {:<20} {:<10} {:<18} {:>8} {:>6}  {}",
                        c.id,
                        c.name,
                        c.provider.as_str(),
                        format!("{:?}", c.status),
                        c.priority,
                        c.weight,
                        c.models.join(",")
                    );
                }
            }
        }
        cli::ChannelCommands::Enable { id } => {
            set_channel_status(db, id, ChannelStatus::Enabled).await?;
            println!("Channel {} enabled.", id);
        }
        cli::ChannelCommands::Disable { id } => {
            set_channel_status(db, id, ChannelStatus::ManuallyDisabled).await?;
            println!("Channel {} disabled.", id);
        }
        cli::ChannelCommands::Update {
            id,
            name,
            base_url,
            models,
            priority,
            weight,
        } => {
            let update = admin::ChannelUpdate {
                name,
                base_url,
                models,
                priority,
                weight,
            };
            let channel = admin::update_channel(db, id, update).await?;
            println!("Channel {} updated: {}", channel.id, channel.models.join(","));
        }
        cli::ChannelCommands::Delete { ids } => {
            let deleted = db.delete_channels(&ids).await?;
            println!("Deleted {} channel(s).", deleted);
        }
        cli::ChannelCommands::DeleteDisabled => {
            let deleted = db.delete_disabled_channels().await?;
            println!("Deleted {} disabled channel(s).", deleted);
        }
    }
    Ok(())
}

async fn set_channel_status(db: &PgStore, id: i64, status: ChannelStatus) -> anyhow::Result<()> {
    admin::find_channel(db, id).await?;
    db.set_channel_status(id, status).await
}

async fn handle_user_command(
    db: &PgStore,
    cfg: &Config,
    cmd: cli::UserCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::UserCommands::Create {
            username,
            email,
            quota,
        } => {
            let user = User {
                id: 0,
                username,
                email,
                quota,
                used_quota: 0,
                remind_threshold: cfg.quota_remind_threshold,
            };
            let id = db.insert_user(&user).await?;
            println!("User created: ID {}", id);
        }
        cli::UserCommands::List { page } => {
            let users = db.list_users(Page { page, ..Page::default() }).await?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<6} {:<20} {:<28} {:>14} {:>14}", "ID", "USERNAME", "EMAIL", "QUOTA", "USED");
                for u in users {
                    println!(
                        "{:<6} {:<20} {:<28} {:>14} {:>14}",
                        u.id,
                        u.username,
                        u.email.unwrap_or_default(),
                        display_quota(u.quota, cfg.quota_per_unit),
                        display_quota(u.used_quota, cfg.quota_per_unit)
                    );
                }
            }
        }
        cli::UserCommands::Topup { id, amount } => {
            if amount <= 0 {
                anyhow::bail!("--amount must be positive");
            }
            if !db.top_up_user(id, amount).await? {
                anyhow::bail!("user {} not found", id);
            }
            println!(
                "Credited {} ({}) to user {}.",
                amount,
                display_quota(amount, cfg.quota_per_unit),
                id
            );
        }
    }
    Ok(())
}

/// Quota units rendered as dollars.
fn display_quota(quota: i64, quota_per_unit: i64) -> String {
    if quota_per_unit <= 0 {
        return quota.to_string();
    }
    format!("${:.2}", quota as f64 / quota_per_unit as f64)
}
