use rendezvous::config::HubConfig;
use rendezvous::hub::HubServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = HubConfig::from_env();
    info!(configuration = ?config, "Loaded hub configuration");

    println!("   Rendezvous Hub");
    println!("   Binding to {}", config.listen_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = HubServer::bind(config).await?;
    let stats = server.run().await?;
    info!("Stopped after {} relayed messages", stats.relay.delivered);
    Ok(())
}
