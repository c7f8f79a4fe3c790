use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};
use crate::{
    api::handler::AppState,
    config::Config,
    error::AppResult,
    execution::{HttpLedgerGateway, LedgerGateway},
    ledger::{
        memory::{MemoryStore, MemoryTreasureMarker},
        models::{BrokerPayment, LegacyReclaim, TreasuryBurial, TreasuryClaim},
        repository::{PgSettlementStore, PgTreasureMarker, SettlementStore, TreasureMarker},
    },
    reputation::LogReputationReporter,
    settlement::{
        burial::BurialSettlement, claim::ClaimSettlement, payment::PaymentSettlement,
        scheduler::SettlementScheduler, SettlementContext,
    },
    wallet::{KeyVault, MainWallet},
};

/// Everything `main` needs: the HTTP state and the scheduler to start
pub struct Service {
    pub state: AppState,
    pub scheduler: SettlementScheduler,
}

struct Stores {
    payments: Arc<dyn SettlementStore<BrokerPayment>>,
    burials: Arc<dyn SettlementStore<TreasuryBurial>>,
    claims: Arc<dyn SettlementStore<TreasuryClaim>>,
    legacy_reclaims: Arc<dyn SettlementStore<LegacyReclaim>>,
    marker: Arc<dyn TreasureMarker>,
}

impl Stores {
    fn postgres(pool: PgPool) -> Self {
        Self {
            payments: Arc::new(PgSettlementStore::new(pool.clone())),
            burials: Arc::new(PgSettlementStore::new(pool.clone())),
            claims: Arc::new(PgSettlementStore::new(pool.clone())),
            legacy_reclaims: Arc::new(PgSettlementStore::new(pool.clone())),
            marker: Arc::new(PgTreasureMarker::new(pool)),
        }
    }

    fn memory() -> Self {
        Self {
            payments: Arc::new(MemoryStore::new()),
            burials: Arc::new(MemoryStore::new()),
            claims: Arc::new(MemoryStore::new()),
            legacy_reclaims: Arc::new(MemoryStore::new()),
            marker: Arc::new(MemoryTreasureMarker::new()),
        }
    }
}

pub async fn initialize_service(config: &Config) -> AppResult<Service> {
    info!("Initializing settlement components ...");

    // Custody
    let vault = Arc::new(KeyVault::from_passphrase(&config.key_vault_secret)?);
    let wallet = Arc::new(MainWallet::new(
        config.main_wallet_address.clone(),
        config.main_wallet_encrypted_key.clone(),
    ));
    // Fail at startup rather than on the first funding transfer
    wallet.signing_key(&vault)?;
    info!("✅ Main wallet {} unsealed", wallet.address());

    // Ledger gateway
    let gateway: Arc<dyn LedgerGateway> = Arc::new(HttpLedgerGateway::new(
        config.ledger_url.clone(),
        Duration::from_secs(config.ledger_timeout_secs),
    )?);
    info!("✅ Ledger gateway at {}", config.ledger_url);

    let stores = match &config.database_url {
        Some(url) => Stores::postgres(initialize_database(url).await?),
        None => {
            warn!("⚠️  DATABASE_URL not set - settlement records kept in memory only");
            Stores::memory()
        }
    };

    let context = Arc::new(SettlementContext::new(
        gateway.clone(),
        vault,
        wallet.clone(),
        config.gas_limits,
    ));
    let tx_timeout = config.tx_timeout();
    let concurrency = config.confirmation_concurrency;

    let payments = PaymentSettlement::new(
        stores.payments,
        context.clone(),
        Arc::new(LogReputationReporter),
        tx_timeout,
        concurrency,
    )
    .with_beta_timeout_multiplier(config.beta_timeout_multiplier);

    let burials = BurialSettlement::new(
        stores.burials,
        stores.marker,
        context.clone(),
        tx_timeout,
        concurrency,
    );

    let claims = ClaimSettlement::new(
        "treasury_claims",
        stores.claims,
        context.clone(),
        tx_timeout,
        concurrency,
    );

    let legacy_reclaims = ClaimSettlement::new(
        "legacy_reclaims",
        stores.legacy_reclaims,
        context,
        tx_timeout,
        concurrency,
    );

    let scheduler = SettlementScheduler::new()
        .with_job(Arc::new(payments), config.payment)
        .with_job(Arc::new(burials), config.burial)
        .with_job(Arc::new(claims), config.claim)
        .with_job(Arc::new(legacy_reclaims), config.legacy_reclaim);
    info!("✅ Settlement jobs registered");

    let state = AppState {
        gateway,
        wallet,
        jobs: scheduler.statuses(),
    };

    Ok(Service { state, scheduler })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
