use clap::Parser;
use migrator::app;
use migrator::cli::Cli;
use migrator::errors::AppError;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    if let Err(err) = app::run(cli).await {
        let code = err.downcast_ref::<AppError>().map(AppError::exit_code).unwrap_or(1);
        if matches!(err.downcast_ref::<AppError>(), Some(AppError::Interrupted)) {
            tracing::warn!("{err:?}");
        } else {
            tracing::error!("{err:?}");
        }
        std::process::exit(code);
    }
}

fn init_tracing() {
    let level = std::env::var("MIG_LOGGING__LEVEL").unwrap_or_else(|_| "info".to_string());
    let json_logs = std::env::var("MIG_LOGGING__JSON_LOGS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json_logs {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    let _ = result;
}
