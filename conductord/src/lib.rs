//! conductord: keeps one engine process alive, tracks workspaces and routes
//! per-directory requests to engine instances.

pub mod args;
mod auth;
pub mod daemon;
pub mod engine;
pub mod eviction;
pub mod http;
pub mod registry;
pub mod router;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use daemon::{run, VERSION};

/// Install the stderr tracing subscriber. `RUST_LOG` wins unless `debug` is set.
pub fn init_tracing(debug: bool, default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
