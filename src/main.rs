use clap::Parser;
use icloud2gmail::app;
use icloud2gmail::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load the environment before anything reads configuration.
    match &cli.env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                eprintln!("failed to load env file {}: {e}", path.display());
                std::process::exit(app::EXIT_USER_ERROR);
            }
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    init_tracing();

    let code = app::run(cli).await;
    std::process::exit(code);
}

fn init_tracing() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
