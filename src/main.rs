use matrix_agent_bridge::config::BridgeConfig;
use matrix_agent_bridge::rocket_with_config;

#[rocket::main]
async fn main() {
    let config = BridgeConfig::from_env();

    if let Err(e) = config.validate() {
        eprintln!("❌ {e}");
        std::process::exit(1);
    }

    println!("🌉 Starting matrix-agent-bridge");
    println!("🏠 Homeserver: {}", config.homeserver_url);
    println!("🌐 Server name: {}", config.server_name);
    println!(
        "💾 Storage: {}",
        match config.storage_mode {
            matrix_agent_bridge::config::StorageMode::File =>
                format!("file ({})", config.data_dir),
            matrix_agent_bridge::config::StorageMode::Api =>
                format!("api ({})", config.storage_api_url),
        }
    );
    println!("🌌 Space: {}", config.space_name);
    println!("🪝 Webhook surface on port {}", config.webhook_port);
    if config.webhook_skip_verification {
        eprintln!("⚠️ Webhook signature verification is DISABLED (dev mode)");
    }
    if config.proxy_port != 0 {
        println!(
            "🔀 Session proxy on port {} → {}",
            config.proxy_port, config.proxy_upstream_url
        );
    }

    if let Err(e) = rocket_with_config(config).launch().await {
        eprintln!("❌ Bridge failed to start: {e}");
        std::process::exit(1);
    }
}
