//! Stealth Yield Ledger Server
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Client (Frontend)                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum Web Server                         │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                      Routes Layer                        ││
//! │  │  /health  /positions/*  /pools/*  /stats/*  /ws         ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Services Layer                        ││
//! │  │  PositionLedger   ProofEngine   StatsAggregator         ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Settlement Layer                      ││
//! │  │  PostgreSQL (DATABASE_URL)   or   In-memory             ││
//! │  └─────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stealth_yield_ledger::{
    create_router,
    sealed::{EnclaveScheme, SealingScheme},
    services::{InMemorySettlement, SettlementAdapter},
    AppState, Config, Database, PositionLedger, WsHub,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 환경변수 로드
    dotenvy::dotenv().ok();

    // 로깅 초기화
    // RUST_LOG=debug,sqlx=warn 형태로 레벨 제어 가능
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stealth_yield_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting Stealth Yield Ledger");

    // 설정 로드
    let config = Config::from_env()?;
    tracing::info!("📋 Configuration loaded: {:?}", config);

    // Sealing enclave
    let scheme: Arc<dyn SealingScheme> = match &config.sealing_key {
        Some(seed) => Arc::new(EnclaveScheme::from_hex_seed(seed).context("invalid SEALING_KEY")?),
        None => {
            tracing::warn!("⚠️  SEALING_KEY not set, using an ephemeral enclave key");
            Arc::new(EnclaveScheme::generate())
        }
    };
    tracing::info!("🔐 Sealing enclave initialized");

    // Settlement adapter
    let settlement: Arc<dyn SettlementAdapter> = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url).await.context("database connection failed")?;
            tracing::info!("🗄️  Database connected");

            db.run_migrations().await?;
            tracing::info!("📦 Migrations completed");
            Arc::new(db)
        }
        None => {
            tracing::warn!("⚠️  DATABASE_URL not set, using in-memory settlement");
            Arc::new(InMemorySettlement::new())
        }
    };

    // 원장 복구
    let ledger = PositionLedger::recover(scheme, settlement, config.ledger_config())
        .await
        .context("ledger recovery failed")?;
    tracing::info!("📒 Ledger ready");

    // 앱 상태 구성
    let state = AppState {
        ledger: Arc::new(ledger),
        hub: Arc::new(WsHub::new()),
        config: Arc::new(config.clone()),
    };

    // 라우터 구성
    let app = create_router(state);

    // 서버 시작
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("🌐 Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
