use std::path::PathBuf;
use std::sync::Arc;
use switchboard::error::AppError;

#[tokio::main]
async fn main() {
    let config_path = resolve_config_path();
    let config = match switchboard::config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err.message);
            std::process::exit(1);
        }
    };

    init_tracing(&config.settings);
    switchboard::config::warn_unrecognized_keys(&config);

    if let Err(err) = run(config_path, config).await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

fn resolve_config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SWITCHBOARD_CONFIG").ok())
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"))
}

fn init_tracing(settings: &switchboard::config::Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "{},switchboard={}",
            settings.log_level, settings.log_level
        ))
    });
    match &settings.log_file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|err| {
                    eprintln!("error: cannot open log file {path}: {err}");
                    std::process::exit(1);
                });
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .json()
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
    }
}

async fn run(
    config_path: PathBuf,
    config: switchboard::config::Config,
) -> Result<(), AppError> {
    let addr = format!("{}:{}", config.settings.host, config.settings.port);
    let state = switchboard::app::load_state_with_config(config_path, config).await?;
    let app = switchboard::app::build_app(state);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_failed",
            format!("{addr}: {err}"),
        )
    })?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "serve_failed",
            err.to_string(),
        )
    })?;
    Ok(())
}
