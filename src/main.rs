use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use ladderbot::config::BotConfig;
use ladderbot::engine::LadderEngine;
use ladderbot::gateway::GatewayBox;
use ladderbot::ledger::FileLedger;
use ladderbot::server;
use log::LevelFilter;
use std::env;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| {
                // Default log configuration with HTTP client internals suppressed
                "debug,hyper=info,reqwest=info,h2=info".to_string()
            }))
            .unwrap_or(LevelFilter::Debug),
        )
        .init();

    log::info!("🚀 Starting ladderbot with dual webhook endpoints");
    let cfg = BotConfig::from_env_or_yaml().expect("invalid bot config");
    cfg.log_summary();

    let gateway = GatewayBox::create(&cfg).expect("failed to initialize exchange gateway");
    let ledger = FileLedger::new(Path::new(&cfg.data_dir), cfg.state_backups_kept)
        .expect("failed to initialize ledger");

    let port = cfg.port;
    let engine = Arc::new(LadderEngine::new(cfg, Arc::new(gateway), Arc::new(ledger)));
    tokio::spawn(engine.clone().run_monitor());

    let app = server::router(engine);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("[SERVER] listening on 0.0.0.0:{}", port);
    axum::serve(listener, app).await
}
