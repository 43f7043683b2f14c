use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use course_server::{
    api::{ApiDoc, AppState, router},
    config::Config,
    db,
    utils::init_log,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{ExpiredDeletion, Expiry, SessionManagerLayer, cookie::time::Duration};
use tower_sessions_sqlx_store::SqliteStore;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Debug, Parser)]
#[command(author, version, about = "Course management REST server")]
struct Args {
    /// TOML config file; built-in defaults when absent
    #[arg(short, long, env = "COURSE_SERVER_CONFIG")]
    config: Option<PathBuf>,
    #[arg(short, long, env = "COURSE_SERVER_DATABASE")]
    database: Option<PathBuf>,
    #[arg(short = 'H', long, env = "COURSE_SERVER_HOST")]
    host: Option<String>,
    #[arg(short, long, env = "COURSE_SERVER_PORT")]
    port: Option<u16>,
    /// Write daily-rotated logs here instead of stdout
    #[arg(short, long, env = "COURSE_SERVER_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(database) = self.database {
            config.database = database;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(log_dir) = self.log_dir {
            config.log_dir = Some(log_dir);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Args::parse().into_config()?;
    let _guard = init_log(config.log_dir.clone());

    let database = db::connect(&config.database).await?;

    let session_store = SqliteStore::new(database.clone());
    session_store.migrate().await?;
    let deletion_task = tokio::task::spawn(
        session_store
            .clone()
            .continuously_delete_expired(tokio::time::Duration::from_secs(60)),
    );
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(config.tls.is_some())
        .with_expiry(Expiry::OnInactivity(Duration::days(config.session_ttl_days)));

    let state = Arc::new(AppState::new(database, config.pagination));
    let app = router(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(session_layer)
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr()))?;
    match &config.tls {
        Some(tls) => {
            // another crate may already have installed a provider
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
            let rustls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                    .await
                    .context("failed to load TLS certificate")?;
            info!("Starting server at https://{}", addr);
            info!("Swagger UI available at https://{}/swagger-ui/", addr);
            axum_server::bind_rustls(addr, rustls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!("Starting server at http://{}", addr);
            info!("Swagger UI available at http://{}/swagger-ui/", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }

    deletion_task.abort();
    Ok(())
}
