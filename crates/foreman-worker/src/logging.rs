use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "foreman_worker=info,foreman_core=info,foreman_agent=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter;
/// `FOREMAN_LOG_FORMAT=json` switches to one JSON object per line.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let json = std::env::var("FOREMAN_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().with_current_span(true).try_init().ok();
    } else {
        builder.try_init().ok();
    }
}
