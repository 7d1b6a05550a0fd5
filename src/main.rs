use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::{self, Duration as TokioDuration};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fdm::config::{self, AppConfig};
use fdm::state::AppState;
use fdm::{db, file_parser, fixtures, mail, routes, users};

#[derive(Parser)]
#[command(name = "fdm")]
#[command(about = "File data management server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the database, then run the HTTP server and the background workers
    Serve,

    /// Create or upgrade the database schema
    Migrate,

    /// Create a superuser, or promote an existing user and set its password
    CreateSuperuser {
        #[arg(long)]
        email: String,

        #[arg(long, env = "FDM_SUPERUSER_PASSWORD")]
        password: String,

        #[arg(long, default_value = "")]
        first_name: String,

        #[arg(long, default_value = "")]
        last_name: String,
    },

    /// Write a JSON fixture of users, settings, projects, folders and templates
    DumpData {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upsert the records of a JSON fixture
    LoadData {
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Enqueue a test mail and dispatch it right away
    SendTestMail {
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging: stdout plus daily rotated file under ./logs
    std::fs::create_dir_all("logs").ok();
    let (stdout_nb, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let file_appender = tracing_appender::rolling::daily("logs", "fdm.log");
    let (file_nb, file_guard) = tracing_appender::non_blocking(file_appender);
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,tower_http=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(stdout_nb))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_nb))
        .init();
    // Keep the guards alive so the non-blocking writers flush on exit
    let _log_guards = (stdout_guard, file_guard);

    // Embedded defaults -> fdm.toml -> FDM_CONFIG -> FDM__* env
    let app_cfg = config::load()?;

    match cli.command {
        Commands::Serve => serve(app_cfg).await,
        Commands::Migrate => {
            open_database(&app_cfg).await?;
            info!("Database schema is up to date");
            Ok(())
        }
        Commands::CreateSuperuser { email, password, first_name, last_name } => {
            let pool = open_database(&app_cfg).await?;
            let email = fdm::error::validation::validate_email(&email)?;
            let user = users::upsert_superuser(&pool, &email, &password, &first_name, &last_name).await?;
            info!(user = %user.id, "Superuser {} is ready", user.email);
            Ok(())
        }
        Commands::DumpData { output } => {
            let pool = open_database(&app_cfg).await?;
            let records = fixtures::dump(&pool).await?;
            let json = serde_json::to_string_pretty(&records)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json).await.with_context(|| format!("writing {}", path.display()))?;
                    info!("Dumped {} records to {}", records.len(), path.display());
                }
                None => println!("{}", json),
            }
            Ok(())
        }
        Commands::LoadData { input } => {
            let pool = open_database(&app_cfg).await?;
            let raw = tokio::fs::read_to_string(&input).await.with_context(|| format!("reading {}", input.display()))?;
            let records: Vec<fixtures::FixtureRecord> = serde_json::from_str(&raw)?;
            let loaded = fixtures::load(&pool, &records).await?;
            info!("Loaded {} records from {}", loaded, input.display());
            Ok(())
        }
        Commands::SendTestMail { to } => {
            let pool = open_database(&app_cfg).await?;
            let recipient = fdm::error::validation::validate_email(&to)?;
            let id = mail::enqueue_db(&pool, &mail::test_mail(&recipient)).await?;
            let transport = mail::transport_from_config(&app_cfg.mail)?;
            if !mail::send_entry(&pool, transport.as_ref(), &app_cfg.mail, id).await? {
                anyhow::bail!("sending the test mail failed; it stays in the outbox for retry");
            }
            info!("Test mail sent to {}", recipient);
            Ok(())
        }
    }
}

/// Opens the configured database and brings its schema up to date.
async fn open_database(cfg: &AppConfig) -> anyhow::Result<sqlx::SqlitePool> {
    let db_url = &cfg.database.url;
    config::ensure_sqlite_parent_dir(db_url)?;
    let pool = db::connect(db_url, cfg.database.max_connections).await?;
    db::init_db(&pool).await?;
    Ok(pool)
}

async fn serve(app_cfg: AppConfig) -> anyhow::Result<()> {
    let pool = open_database(&app_cfg).await?;
    tokio::fs::create_dir_all(&app_cfg.storage.root)
        .await
        .with_context(|| format!("creating storage root {}", app_cfg.storage.root.display()))?;

    let state = AppState::new(pool, app_cfg.clone());
    let cancel = CancellationToken::new();
    let mut workers = Vec::new();

    // Periodic cleanup for per-endpoint rate limiters to avoid memory growth
    {
        let rl = state.rate_limiter.clone();
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            let mut ticker = time::interval(TokioDuration::from_secs(300));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => rl.cleanup_all().await,
                }
            }
        }));
    }

    if app_cfg.workers.enabled {
        workers.push(tokio::spawn(file_parser::run_worker(state.clone(), cancel.clone())));
        let transport = mail::transport_from_config(&app_cfg.mail)?;
        workers.push(tokio::spawn(mail::run_dispatcher(state.clone(), transport, cancel.clone())));
    } else {
        info!("Background workers are disabled");
    }

    let app = routes::build_router(state);
    // Permissive CORS only for local development with a separately served UI
    let app = if cfg!(debug_assertions) { app.layer(CorsLayer::permissive()) } else { app };

    let port: u16 = app_cfg.server.port;
    let host: String = app_cfg.server.host.clone();
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen addr {}:{} - {}", host, port, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("fdm listening on http://{}", listener.local_addr()?);
    let shutdown = {
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    };
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    cancel.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received. Stopping server...");
}
