use dexwatch_common::messages::Message;
use dexwatch_module_dex_indexer::DexIndexer;
use anyhow::Result;
use caryatid_process::Process;
use caryatid_sdk::module_registry::ModuleRegistry;
use clap::Parser;
use config::{Config, Environment, File};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["indexer.toml".to_string()])]
    config: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Get arguments and config
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter("info,fjall=warn").init();
    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("DEXWATCH")).build()?);

    let mut process = Process::<Message>::create(config).await;

    // Blocks arrive on the bus from an external chain-sync process
    info!("Registering DEX indexer");
    process.register(Arc::new(DexIndexer));

    process.run().await?;

    Ok(())
}
