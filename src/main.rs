use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use sqlx::migrate::Migrator;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duka_pay::adapters::PostgresLedger;
use duka_pay::cli::{Cli, Commands, DbCommands, TxCommands};
use duka_pay::config::Config;
use duka_pay::daraja::DarajaClient;
use duka_pay::services::{PaymentService, ReconciliationService};
use duka_pay::{cli, create_app, db, services, startup, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Reconcile => {
            let (_, _, reconciliation) = build_services(&config).await?;
            cli::handle_reconcile(&reconciliation).await
        }
        Commands::TimeoutStale => {
            let (_, _, reconciliation) = build_services(&config).await?;
            cli::handle_timeout_stale(&reconciliation).await
        }
        Commands::Tx(TxCommands::ForceCancel { tx_id, reason }) => {
            let (ledger, _, _) = build_services(&config).await?;
            cli::handle_tx_force_cancel(ledger.as_ref(), tx_id, &reason).await
        }
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config),
    }
}

async fn build_services(
    config: &Config,
) -> anyhow::Result<(
    Arc<PostgresLedger>,
    PaymentService,
    ReconciliationService,
)> {
    let pool = db::create_pool(config).await?;
    let ledger = Arc::new(PostgresLedger::new(pool));
    let gateway = Arc::new(DarajaClient::new(config.mpesa.clone()));
    let payments = PaymentService::new(
        ledger.clone(),
        gateway.clone(),
        config.callbacks.clone(),
    );
    let reconciliation =
        ReconciliationService::new(ledger.clone(), gateway, payments.clone());
    Ok((ledger, payments, reconciliation))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config).await?;

    let migrator = Migrator::new(Path::new("./migrations")).await?;
    migrator.run(&pool).await?;
    tracing::info!("Database migrations completed");

    let report = startup::validate_environment(&config, &pool).await?;
    report.print();
    if !report.is_valid() {
        anyhow::bail!("Startup validation failed");
    }

    let ledger: Arc<PostgresLedger> = Arc::new(PostgresLedger::new(pool));
    let gateway = Arc::new(DarajaClient::new(config.mpesa.clone()));
    tracing::info!(
        environment = ?config.mpesa.environment,
        "Daraja client initialized"
    );

    let payments = PaymentService::new(
        ledger.clone(),
        gateway.clone(),
        config.callbacks.clone(),
    );
    let reconciliation =
        ReconciliationService::new(ledger.clone(), gateway, payments.clone());

    tokio::spawn(services::reconciliation::run_reconciler(
        reconciliation.clone(),
    ));
    tokio::spawn(services::reconciliation::run_timeout_sweeper(
        reconciliation,
    ));

    let app = create_app(AppState {
        ledger,
        payments,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
