use clap::Parser;
use parley::constants::{API_KEY_ENV, BASE_URL_ENV};
use parley::db::{init_db, ConversationStore};
use parley::routes::build_router;
use parley::{AppState, Args};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "parley=debug,flight_recorder=info,tower_http=info".into(),
    };

    let _ = std::fs::create_dir_all(&args.log_dir);
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "parley.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    parley::logging::setup_panic_hook();

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let client = match args.build_http_client() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e.inner);
            std::process::exit(1);
        }
    };

    let source = match args.reply_source(
        client,
        std::env::var(API_KEY_ENV).ok(),
        std::env::var(BASE_URL_ENV).ok(),
    ) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Error: {}", e.inner);
            eprintln!("Error: {}", e.inner);
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };
    tracing::info!("Reply source: {}", source.name());

    let addr = format!("{}:{}", args.host, args.port);
    let state = AppState::new(ConversationStore::new(db), source, args);
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Parley listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
