//! Feedcache.
//!
//! Feedcache keeps the media around the active position of a short-form video feed resident on
//! disk. This binary drives the prefetch controller from a scripted scroll session, which is
//! useful for tuning the window and budget against a real media origin.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;
mod replay;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
