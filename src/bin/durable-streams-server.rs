use chrono::{DateTime, Utc};
use clap::Parser;
use durable_streams::{server, types::ServerOptions};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Durable Streams server", long_about = None)]
struct Opts {
    /// Port to listen on
    #[arg(long, env = "DURABLE_STREAMS_PORT", default_value_t = ServerOptions::default().port)]
    port: u16,

    /// Host/address to bind to
    #[arg(long, env = "DURABLE_STREAMS_HOST", default_value_t = ServerOptions::default().host)]
    host: String,

    /// Long-poll timeout, in milliseconds
    #[arg(
        long,
        env = "DURABLE_STREAMS_LONG_POLL_TIMEOUT_MS",
        default_value_t = ServerOptions::default().long_poll_timeout_ms
    )]
    long_poll_timeout_ms: u64,

    /// Cursor rotation interval, in seconds
    #[arg(
        long,
        env = "DURABLE_STREAMS_CURSOR_INTERVAL_SECONDS",
        default_value_t = ServerOptions::default().cursor_interval_seconds
    )]
    cursor_interval_seconds: u64,

    /// Epoch that cursor intervals are counted from, RFC3339
    #[arg(long, env = "DURABLE_STREAMS_CURSOR_EPOCH")]
    cursor_epoch: Option<DateTime<Utc>>,

    /// How long an idle producer's fencing state is retained, in milliseconds
    #[arg(
        long,
        env = "DURABLE_STREAMS_PRODUCER_TTL_MS",
        default_value_t = ServerOptions::default().producer_ttl_ms
    )]
    producer_ttl_ms: i64,
}

impl From<Opts> for ServerOptions {
    fn from(opts: Opts) -> Self {
        let defaults = ServerOptions::default();
        ServerOptions {
            port: opts.port,
            host: opts.host,
            long_poll_timeout_ms: opts.long_poll_timeout_ms,
            cursor_interval_seconds: opts.cursor_interval_seconds,
            cursor_epoch: opts.cursor_epoch.unwrap_or(defaults.cursor_epoch),
            producer_ttl_ms: opts.producer_ttl_ms,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    let options: ServerOptions = opts.into();

    if let Err(err) = server::start_server(options).await {
        tracing::error!(error = %err, "server exited with an error");
        std::process::exit(1);
    }
}
