use std::sync::Arc;

use llm_firewall::audit::{AuditLogger, AuditStore, PgAuditStore};
use llm_firewall::rate_limit::{RateLimiter, RedisCounterStore};
use llm_firewall::{shutdown, FirewallConfig, FirewallState, GrpcAnalyzer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: firewall-gateway <config.json> [--listen HOST:PORT]")?;

    let mut listen_override: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let raw = std::fs::read_to_string(&path)?;
    let config: FirewallConfig = serde_json::from_str(&raw)?;
    config.validate().map_err(|reason| format!("invalid config: {reason}"))?;

    let listen = listen_override
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // The single construction site for every service the pipeline uses.
    let counter_store = Arc::new(RedisCounterStore::new(&config.redis_url)?);
    let limiter = RateLimiter::new(counter_store, config.rate_limit);

    let audit_store: Arc<dyn AuditStore> =
        Arc::new(PgAuditStore::connect_and_migrate(&config.database_url).await?);
    let audit_logger = if config.audit.asynchronous {
        AuditLogger::asynchronous(Arc::clone(&audit_store), config.audit.queue_capacity)
    } else {
        AuditLogger::synchronous(Arc::clone(&audit_store))
    };

    let analyzer = Arc::new(GrpcAnalyzer::new(&config.analyzer)?);

    let state = FirewallState::new(config, limiter, analyzer, audit_store, audit_logger);
    let app = llm_firewall::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "firewall-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::signal())
        .await?;

    let clean = shutdown::drain(&state, shutdown::SHUTDOWN_CEILING).await;
    std::process::exit(if clean { 0 } else { 1 });
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
