//! queFork interceptor service: the same-origin fallback proxy endpoint
//! the web application uses whenever the browser extension path is
//! unavailable.

use quefork_interceptor::config::InterceptorConfig;
use quefork_interceptor::server;

fn main() -> anyhow::Result<()> {
    // Determine config path
    let config_path = {
        let args: Vec<String> = std::env::args().collect();
        // Check for --config flag first
        args.iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1).cloned())
            // Fall back to positional arg
            .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
            .or_else(|| std::env::var("QUEFORK_CONFIG").ok())
            .unwrap_or_else(|| "quefork.toml".to_string())
    };

    // Load configuration
    let config = InterceptorConfig::load(&config_path)?;

    // Build the tokio runtime first — the OTLP gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize tracing (OTLP export is optional — falls back to fmt-only)
        let _tracing_guard = quefork_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            upstream_timeout_secs = config.upstream.timeout_secs,
            "Starting quefork-interceptor"
        );

        server::run(config).await
    })
}
