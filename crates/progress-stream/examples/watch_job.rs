use std::time::Duration;

use clap::Parser;
use progress_stream::prelude::*;

/// Prints a workflow job's progress events until it finishes.
#[derive(Parser, Debug)]
struct Args {
    /// Job to follow.
    job_id: String,
    /// Progress server URL; falls back to PROGRESS_STREAM_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,
    /// poll, sse or socket; falls back to PROGRESS_STREAM_TRANSPORT.
    #[arg(long)]
    transport: Option<TransportKind>,
    /// Poll interval in milliseconds.
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    let _ = dotenvy::dotenv();
    progress_stream::init_observability();
    let args = Args::parse();

    let mut config = match args.base_url {
        Some(base_url) => StreamConfig::new(base_url),
        None => StreamConfig::from_env()?,
    };
    if let Some(transport) = args.transport {
        config = config.transport(transport);
    }
    if let Some(ms) = args.poll_interval_ms {
        config = config.poll_interval(Duration::from_millis(ms));
    }

    let client = StreamClient::builder().config(config).build()?;
    let session = client.session(args.job_id)?;
    let _ready = session.on_ready(|| eprintln!("workflow started"));
    let _events = session.subscribe(
        |event| {
            let agent = event.agent.as_deref().unwrap_or("-");
            let message = event.message.as_deref().unwrap_or("");
            println!("[{}] {agent} {message}", event.kind);
        },
        |_| {},
    );

    let result = session.wait().await.into_result()?;
    println!("{}", result.payload);
    Ok(())
}
