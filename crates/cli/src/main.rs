//! Cartwheel CLI - inspect and edit the remote cart from a terminal.
//!
//! # Usage
//!
//! ```bash
//! # Show the cart
//! cartwheel show
//!
//! # Show the cart as JSON
//! cartwheel show --json
//!
//! # Add a product
//! cartwheel add 64f1c0 --name "Pineapple" --price 10.00 --stock 5 --quantity 2
//!
//! # Change a quantity
//! cartwheel set 64f1c0 3
//!
//! # Remove a line
//! cartwheel remove 64f1c0
//! ```
//!
//! # Environment Variables
//!
//! See `cartwheel_storefront::config`. `CART_API_TOKEN` is required for every
//! command.

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cartwheel_core::Price;
use cartwheel_storefront::StorefrontConfig;

mod commands;

#[derive(Parser)]
#[command(name = "cartwheel")]
#[command(author, version, about = "Cartwheel cart client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current cart
    Show {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Add a product to the cart, or set its quantity if already present
    Add {
        /// Product ID
        product_id: String,

        /// Product display name
        #[arg(short, long)]
        name: String,

        /// Unit price, e.g. `10.50`
        #[arg(short, long, value_parser = commands::cart::parse_price)]
        price: Price,

        /// Units in stock
        #[arg(short, long)]
        stock: u32,

        /// Requested quantity (clamped to stock)
        #[arg(short, long, default_value_t = 1)]
        quantity: i64,
    },
    /// Set the quantity of a line already in the cart
    Set {
        /// Product ID
        product_id: String,

        /// Requested quantity (clamped to 1..=stock)
        #[arg(allow_negative_numbers = true)]
        quantity: i64,
    },
    /// Remove a line from the cart
    Remove {
        /// Product ID
        product_id: String,
    },
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &StorefrontConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match StorefrontConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt::init();
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);

    // Logs go to stderr so stdout stays clean for `show --json`
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cartwheel_storefront=info,cartwheel_cli=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli, config).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        if e
            .downcast_ref::<commands::cart::CommandError>()
            .is_some_and(commands::cart::CommandError::needs_login)
        {
            tracing::error!("Log in again and set CART_API_TOKEN to the new token");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: StorefrontConfig) -> Result<(), Box<dyn std::error::Error>> {
    let session = commands::cart::Session::connect(&config).await?;

    match cli.command {
        Commands::Show { json } => session.show(json)?,
        Commands::Add {
            product_id,
            name,
            price,
            stock,
            quantity,
        } => {
            let product = commands::cart::product(product_id, name, price, stock);
            session.add(product, quantity).await?;
        }
        Commands::Set {
            product_id,
            quantity,
        } => session.set(&product_id.into(), quantity).await?,
        Commands::Remove { product_id } => session.remove(&product_id.into()).await?,
    }
    Ok(())
}
