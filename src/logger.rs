//! Tracing bootstrap for both binaries: JSON output under CI,
//! human-readable otherwise.

use tracing_subscriber::EnvFilter;

pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_current_span(true);

    let result = if json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };

    if let Err(err) = result {
        eprintln!("tracing subscriber already initialized: {err}");
    }
}
