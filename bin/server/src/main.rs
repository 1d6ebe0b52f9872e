use parley_ai::HttpModelClient;
use parley_conversation::{ChatOrchestrator, ConversationStore, InMemoryConversationStore};
use parley_integration::McpToolGateway;
use parley_server::{
    app::{self, AppState},
    config::{LogFormat, ServerConfig},
    db::PgConversationStore,
    error::StartupError,
    telemetry,
};
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let config = ServerConfig::from_env();
    telemetry::init(config.as_ref().map_or(LogFormat::default(), |c| c.log.format));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            error!("{report}");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    config: Result<ServerConfig, config::ConfigError>,
) -> parley_core::Result<(), StartupError> {
    let config = config.map_err(|e| StartupError::Config {
        details: e.to_string(),
    })?;
    info!("Loaded configuration");

    let store: Arc<dyn ConversationStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .map_err(|e| StartupError::Database {
                    details: e.to_string(),
                })?;

            info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| StartupError::Migration {
                    details: e.to_string(),
                })?;

            Arc::new(PgConversationStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL is not set; conversations are kept in memory");
            Arc::new(InMemoryConversationStore::new())
        }
    };

    let model = HttpModelClient::new(config.model.clone()).map_err(|e| {
        StartupError::ModelClient {
            details: e.to_string(),
        }
    })?;
    info!(
        model = %config.model.model_id,
        endpoint = %config.model.base_url(),
        "Configured model client"
    );

    let mut chat = ChatOrchestrator::new(store.clone(), Arc::new(model), config.chat.clone());
    if let Some(tools) = &config.tools {
        let gateway = McpToolGateway::new(tools).map_err(|e| StartupError::ToolGateway {
            details: e.to_string(),
        })?;
        // The tool server may come up after us; requests initialize lazily.
        match gateway.initialize().await {
            Ok(()) => info!(endpoint = %gateway.endpoint(), "Connected to tool server"),
            Err(e) => warn!(endpoint = %gateway.endpoint(), error = %e, "Tool server not ready"),
        }
        chat = chat.with_tools(Arc::new(gateway));
    }

    let state = Arc::new(AppState::new(store, chat));
    let app = app::router(state, &config.cors_origins());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| StartupError::Bind {
            addr: config.bind_addr.clone(),
            details: e.to_string(),
        })?;

    info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| StartupError::Serve {
            details: e.to_string(),
        })?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
