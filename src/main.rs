use form_mailer::{app, config::ServerConfig, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let server_config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    let guard = match logging::init(&server_config.log_file, server_config.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: cannot open log file {}: {e}", server_config.log_file.display());
            std::process::exit(1);
        }
    };
    info!("Starting form-mailer");

    if let Err(e) = app::run(server_config).await {
        error!("Server error: {e}");
        drop(guard);
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
