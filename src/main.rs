use clap::{Parser, Subcommand};
use chrono::Utc;
use haggle::adapters::{
    ChatBridge, CourierRateClient, FlatRateEstimator, PostgresChatBridge, SettlementGateway,
    ShipmentEstimator, SimulatedGateway, StripeGateway,
};
use haggle::config::AppConfig;
use haggle::engine::{OrderEngine, PaymentPolicy, ProposalEngine};
use haggle::error::{HaggleError, Result};
use haggle::fees::FeeCalculator;
use haggle::services::{ExpirySweeper, ExpirySweeperConfig};
use haggle::store::PostgresStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "haggle", about = "Marketplace transaction & negotiation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Run the expiry sweeper
    Sweep {
        /// Run a single sweep cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Print the fee breakdown for a price
    Quote {
        /// Item price in cents
        #[arg(long)]
        price: i64,
        /// Shipping price in cents
        #[arg(long, default_value_t = 0)]
        shipping: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Quote { price, shipping } => {
            init_logging_simple();
            print_quote(price, shipping)?;
        }
        Commands::Migrate => {
            let config = load_config()?;
            init_logging(&config);
            let store = PostgresStore::new(&config.database.url, config.database.max_connections)
                .await?;
            store.migrate().await?;
        }
        Commands::Sweep { once } => {
            let config = load_config()?;
            init_logging(&config);
            run_sweeper(&config, once).await?;
        }
    }

    Ok(())
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::load()?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Config error: {}", e);
        }
        return Err(HaggleError::Validation(format!(
            "invalid configuration: {}",
            errors.join("; ")
        )));
    }
    Ok(config)
}

fn print_quote(price: i64, shipping: i64) -> Result<()> {
    let quote = FeeCalculator::default().quote(price, shipping)?;
    println!("item:              {:>10} cents", quote.item_price_cents);
    println!("shipping:          {:>10} cents", quote.shipping_price_cents);
    println!("platform charge:   {:>10} cents", quote.platform_charge_cents);
    println!("provider charge:   {:>10} cents", quote.payment_provider_charge_cents);
    println!("total charged:     {:>10} cents", quote.total_cents());
    println!("calculator:        {:>10}", quote.calculator_version);
    Ok(())
}

async fn run_sweeper(config: &AppConfig, once: bool) -> Result<()> {
    let store = Arc::new(
        PostgresStore::new(&config.database.url, config.database.max_connections).await?,
    );
    let chat: Arc<dyn ChatBridge> = Arc::new(PostgresChatBridge::new(store.pool().clone()));

    let settlement: Arc<dyn SettlementGateway> = if config.dry_run.enabled {
        Arc::new(SimulatedGateway::new())
    } else {
        Arc::new(StripeGateway::new(
            config.settlement.base_url.as_deref(),
            config.settlement.secret_key.clone(),
        )?)
    };
    let shipping: Arc<dyn ShipmentEstimator> = match &config.shipping.base_url {
        Some(base_url) if !config.dry_run.enabled => Arc::new(CourierRateClient::new(base_url)?),
        _ => Arc::new(FlatRateEstimator::new(config.shipping.flat_rate_cents)),
    };

    let policy = PaymentPolicy {
        currency: config.payments.currency.clone(),
        payment_window: chrono::Duration::days(config.payments.payment_window_days),
    };
    let orders = Arc::new(OrderEngine::new(
        store.clone(),
        settlement,
        shipping,
        chat.clone(),
        policy,
    ));
    let proposals = Arc::new(ProposalEngine::new(store, chat, orders.clone()));

    let sweeper = ExpirySweeper::new(
        proposals,
        orders,
        ExpirySweeperConfig {
            interval_secs: config.sweeper.interval_secs,
        },
    );

    if once {
        let (proposals_expired, orders_expired) = sweeper.run_once(Utc::now()).await?;
        info!(
            "Sweep done: {} proposals, {} orders expired",
            proposals_expired, orders_expired
        );
        return Ok(());
    }

    tokio::select! {
        _ = sweeper.run() => {},
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            sweeper.stop();
        }
    }
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},haggle=debug,sqlx=warn", config.logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_logging_simple() {
    // Minimal logging for CLI commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
