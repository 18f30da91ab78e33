//! dlcache.
//!
//! dlcache is a local caching proxy for game and mod downloads. Clients request
//! `http://127.0.0.1:55555/<url>` instead of `<url>`, and allowlisted responses are served from
//! a file-system cache when possible.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
