use cellblockd::{Config, Server};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    Server::new(config).start().await?;
    Ok(())
}
