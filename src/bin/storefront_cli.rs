use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use storefront_payments::{
    config::{self, AppConfig},
    db,
    events::{self, EventHandler, EventSender},
    gateways::{http_client, GatewayRegistry},
    services::{
        catalog::NewProduct,
        notifications::{transport_from_config, NotificationDispatcher},
    },
    AppState,
};
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "storefront-cli",
    about = "Operator tools for storefront payments",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Add a product to the catalog
    AddProduct(AddProductArgs),
    /// Run one reconciliation sweep over overdue payments
    Sweep,
    /// Re-run a stored webhook event through reconciliation
    Replay(IdArgs),
    /// Poll the provider for an order's latest payment
    Verify(IdArgs),
    /// List orders flagged for manual review
    Review,
}

#[derive(Args)]
struct AddProductArgs {
    #[arg(long, help = "Unique stock keeping unit")]
    sku: String,
    #[arg(long, help = "Display name")]
    name: String,
    #[arg(long, help = "Unit price in major units, e.g. 20.00")]
    price: String,
    #[arg(long, default_value_t = 0, help = "Units on hand")]
    stock: i32,
}

#[derive(Args)]
struct IdArgs {
    id: Uuid,
}

struct CliContext {
    state: AppState,
    events: JoinHandle<()>,
}

impl CliContext {
    async fn initialize(config: AppConfig) -> Result<Self> {
        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);

        let gateways =
            GatewayRegistry::from_config(&config).context("failed to configure payment providers")?;

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let client = http_client(Duration::from_secs(config.provider_timeout_secs))?;
        let dispatcher = NotificationDispatcher::new(
            db.clone(),
            transport_from_config(&config.notifications, client),
        );
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(dispatcher)];
        let events = tokio::spawn(events::process_events(event_rx, handlers));

        let state = AppState::new(config, db, gateways, EventSender::new(event_tx))
            .context("failed to build services")?;
        Ok(Self { state, events })
    }

    /// Drops every event sender and waits for queued notifications to go out.
    async fn finish(self) -> Result<()> {
        drop(self.state);
        self.events.await.context("event processor panicked")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(config.log_level(), config.log_json);

    if let Commands::Migrate = cli.command {
        let pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
        println!("Migrations applied");
        return Ok(());
    }

    let context = CliContext::initialize(config).await?;
    let result = run(&context.state, cli.command, cli.json).await;
    context.finish().await?;
    result
}

async fn run(state: &AppState, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Migrate => unreachable!("handled before services are built"),
        Commands::AddProduct(args) => {
            let price = Decimal::from_str(&args.price)
                .with_context(|| format!("invalid price {}", args.price))?;
            let product = state
                .catalog
                .create_product(NewProduct {
                    sku: args.sku,
                    name: args.name,
                    price,
                    stock: args.stock,
                })
                .await?;
            if json {
                print_json(&product)?;
            } else {
                println!(
                    "Product {} ({}) created: {} at {}, {} in stock",
                    product.id, product.sku, product.name, product.price, product.stock
                );
            }
        }
        Commands::Sweep => {
            let report = state.sweep.run_once().await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Sweep: polled {}, settled {}, expired {}, abandoned {}, errors {}",
                    report.polled, report.settled, report.expired, report.abandoned, report.errors
                );
            }
        }
        Commands::Replay(args) => {
            let outcome = state.payments.replay_event(args.id).await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!("Event {}: {:?}", args.id, outcome);
            }
        }
        Commands::Verify(args) => {
            let status = state.payments.verify_order(args.id).await?;
            if json {
                print_json(&status)?;
            } else {
                println!("Order {} is {}", status.order.id, status.order.status);
                match &status.intent {
                    Some(intent) => println!(
                        "Latest intent {} via {} is {}",
                        intent.id, intent.provider, intent.status
                    ),
                    None => println!("No payment has been started"),
                }
                if let Some(outcome) = &status.outcome {
                    println!("Poll result: {:?}", outcome);
                }
            }
        }
        Commands::Review => {
            let orders = state.orders.list_flagged().await?;
            if json {
                print_json(&orders)?;
            } else if orders.is_empty() {
                println!("No orders need review.");
            } else {
                println!("Orders needing review ({}):", orders.len());
                for order in &orders {
                    println!(
                        "- Order {} • status {} • total {} {} • {}",
                        order.id,
                        order.status,
                        order.total,
                        order.currency,
                        order.review_reason.as_deref().unwrap_or("no reason recorded")
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
