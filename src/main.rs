//! Application entry point for the Suratan demo server.
//!
//! Initializes the Tokio runtime, sets up logging and panic handling, and
//! runs the server defined in the `suratan` library crate.

use log::error;
use std::panic;

#[tokio::main]
async fn main() {
    // Initialize logging based on RUST_LOG environment variable (defaulting to "info").
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    // Make sure panics end up in the log rather than only on stderr.
    panic::set_hook(Box::new(|panic_info| {
        error!("Panic occurred: {}", panic_info);
    }));

    if let Err(e) = suratan::run().await {
        error!("Application exited with error: {}", e);
        std::process::exit(1);
    }
}
