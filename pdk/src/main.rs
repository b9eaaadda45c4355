use clap::{Parser, Subcommand};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ObservabilitySnafu, Result},
    kafka::KafkaArgs,
    taxi::TaxiArgs,
};

mod args;
mod error;
mod kafka;
mod taxi;

#[derive(Parser)]
#[command(name = "pdk")]
#[command(about = "Pilosa Development Kit")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load CSV files listed in a URL file
    Taxi {
        #[clap(flatten)]
        inner: TaxiArgs,
    },
    /// Load Avro messages from Kafka topics
    Kafka {
        #[clap(flatten)]
        inner: KafkaArgs,
    },
}

#[tokio::main]
#[snafu::report]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = pdk_observability::init_observability(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
    .context(ObservabilitySnafu {})?;

    let ct = CancellationToken::new();

    tokio::spawn({
        let ct = ct.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            ct.cancel();
        }
    });

    match cli.command {
        Commands::Taxi { inner } => inner.run(ct).await,
        Commands::Kafka { inner } => inner.run(ct).await,
    }
}
