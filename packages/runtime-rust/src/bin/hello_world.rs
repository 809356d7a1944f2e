//! Sample service: one `greet` operation answering "Hello there <name>".

use std::sync::Arc;

use clap::Parser;
use opbus_core::{OperationContext, ServiceBuilder};
use opbus_runtime::bus::NatsConnector;
use opbus_runtime::{init_tracing, BusArgs, ServiceRuntime, TracingOptions};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "hello-world", version, about = "Sample opbus service")]
struct Cli {
    #[command(flatten)]
    bus: BusArgs,

    /// Console log filter directives.
    #[arg(long, env = "OPBUS_LOG", default_value = "info")]
    log: String,

    /// Write console logs as JSON lines.
    #[arg(long, env = "OPBUS_LOG_JSON")]
    json: bool,
}

async fn greet(ctx: OperationContext) -> anyhow::Result<()> {
    let data = ctx.payload_as_str();
    info!(data = %data, "processing incoming message");
    ctx.reply_text(format!("Hello there {data}")).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let receiver = init_tracing(&TracingOptions {
        filter: cli.log.clone(),
        json: cli.json,
        ..TracingOptions::default()
    })?;

    let settings = cli.bus.resolve()?;
    let service = ServiceBuilder::new("hello-world", "1.0.0")
        .with_description("Greets whoever asks")
        .with_operation("greet", greet)?
        .build()?;

    ServiceRuntime::new(service, Arc::new(NatsConnector::new(settings)))
        .with_log_forwarding(receiver)
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
