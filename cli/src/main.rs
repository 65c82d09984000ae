//! Command-line entry point for appdepot.
// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

async fn run() -> Result<i32> {
    appdepot_utils::initialize_tracing();
    tracing::trace!("starting");
    appdepot_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // An aborted transaction already said everything it needed to;
            // repeating it on stderr is just noise.
            if !appdepot_lib::is_aborted(&e) {
                eprintln!("error: {:#}", e);
            }
            std::process::exit(1);
        }
    }
}
