use clap::Parser;
use plant_gateway::app::{self, Options};
use std::panic::{self, PanicHookInfo};
use tracing::info;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, cron) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();

    let settings = match app::load_settings(&options) {
        Ok(settings) => settings,
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    };

    // held until exit so buffered log lines are flushed
    let guard = match app::init_logging(&options, &settings) {
        Ok(guard) => guard,
        Err(why) => {
            eprintln!("error: cannot set up logging: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    };
    info!("plant-gateway version {}", env!("CARGO_PKG_VERSION"));
    info!("loaded config file from {}", options.config.display());

    let code = match app::run(options, settings).await {
        Ok(failed) if failed.is_empty() => EXIT_SUCCESS,
        Ok(_) => EXIT_ERROR,
        Err(why) => {
            eprintln!("error: {}", why);
            EXIT_ERROR
        }
    };

    drop(guard);
    std::process::exit(code);
}
