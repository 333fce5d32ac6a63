pub mod agent_service;
pub mod clients;
pub mod config;
pub mod conversations;
pub mod error;
pub mod events;
pub mod identity;
pub mod ingress;
pub mod matrix;
pub mod models;
pub mod monitor;
pub mod proxy;
pub mod rooms;
pub mod routes;
pub mod storage;
pub mod webhooks;

use std::sync::Arc;
use std::time::Duration;

use rocket_cors::CorsOptions;

use agent_service::AgentServiceClient;
use clients::ClientPool;
use config::BridgeConfig;
use conversations::ConversationTracker;
use events::{EventBus, SubscriptionRegistry};
use identity::IdentityManager;
use monitor::MonitorRegistry;
use rooms::RoomOrchestrator;
use storage::Storage;
use webhooks::WebhookProcessor;

/// Build the webhook surface with configuration from the environment.
pub fn rocket() -> rocket::Rocket<rocket::Build> {
    rocket_with_config(BridgeConfig::from_env())
}

/// Build the webhook surface around an explicit configuration. All five
/// services are constructed once here and shared through managed state —
/// no process-wide globals.
pub fn rocket_with_config(config: BridgeConfig) -> rocket::Rocket<rocket::Build> {
    let storage = Arc::new(Storage::from_config(&config).expect("Failed to open storage"));
    let bus = Arc::new(EventBus::new());
    let identities = Arc::new(IdentityManager::new(storage.clone(), config.clone()));
    let pool = Arc::new(ClientPool::new(
        config.clone(),
        storage.clone(),
        identities.clone(),
        bus.clone(),
    ));
    let orchestrator = Arc::new(RoomOrchestrator::new(
        config.clone(),
        storage.clone(),
        identities.clone(),
        pool.clone(),
    ));
    let tracker = Arc::new(ConversationTracker::new(
        config.conversation_max_age_sec,
        config.dedup_ttl_sec,
    ));
    let monitors = Arc::new(MonitorRegistry::new(config.monitor_max_concurrent));
    let agent_service = Arc::new(AgentServiceClient::new(
        &config.agent_service_url,
        &config.agent_service_token,
    ));
    let processor = Arc::new(WebhookProcessor::new(
        config.clone(),
        tracker.clone(),
        pool.clone(),
        storage.clone(),
        monitors.clone(),
    ));
    let subscriptions = Arc::new(SubscriptionRegistry::new());

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    let figment = rocket::Config::figment()
        .merge(("port", config.webhook_port))
        .merge(("limits.json", 2 * 1024 * 1024));

    rocket::custom(figment)
        .manage(config.clone())
        .manage(storage.clone())
        .manage(bus.clone())
        .manage(identities.clone())
        .manage(pool.clone())
        .manage(orchestrator.clone())
        .manage(tracker.clone())
        .manage(monitors.clone())
        .manage(agent_service.clone())
        .manage(processor)
        .manage(subscriptions.clone())
        .attach(cors)
        .register("/", rocket::catchers![routes::not_found])
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::stats,
                routes::agent_response,
                routes::tool_selector,
                routes::start_conversation,
                routes::post_conversation_response,
                routes::get_conversations,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff("Ingress Pipeline", {
            let bus = bus.clone();
            let tracker = tracker.clone();
            let storage = storage.clone();
            let agent_service = agent_service.clone();
            move |_rocket| {
                Box::pin(async move {
                    ingress::spawn_ingress(&bus, tracker, storage, agent_service, subscriptions);
                    println!("📥 Ingress pipeline started");
                })
            }
        }))
        .attach(rocket::fairing::AdHoc::on_liftoff("Conversation Sweep", {
            let tracker = tracker.clone();
            let monitors = monitors.clone();
            let interval_secs = config.cleanup_interval_sec.max(1);
            move |_rocket| {
                Box::pin(async move {
                    tokio::spawn(async move {
                        let mut interval =
                            tokio::time::interval(Duration::from_secs(interval_secs));
                        // The first tick fires immediately; skip it.
                        interval.tick().await;
                        loop {
                            interval.tick().await;
                            for event_id in tracker.sweep() {
                                eprintln!("⌛ Conversation {event_id} timed out");
                                monitors.cancel(&event_id);
                            }
                        }
                    });
                    println!("🧹 Conversation sweep started (every {interval_secs}s)");
                })
            }
        }))
        .attach(rocket::fairing::AdHoc::on_liftoff("Client Pool Bootstrap", {
            let storage = storage.clone();
            let pool = pool.clone();
            let identities = identities.clone();
            let orchestrator = orchestrator.clone();
            let agent_service = agent_service.clone();
            let our_webhook_url = config.our_webhook_url.clone();
            let webhook_secret = config.webhook_secret.clone();
            move |_rocket| {
                Box::pin(async move {
                    tokio::spawn(async move {
                        match storage.list_identities().await {
                            Ok(known) => {
                                let mut started = 0usize;
                                for identity in known.iter().filter(|i| !i.deactivated) {
                                    match pool.acquire(identity).await {
                                        Ok(_) => started += 1,
                                        Err(e) => eprintln!(
                                            "⚠️ Could not resume client {}: {e}",
                                            identity.id
                                        ),
                                    }
                                }
                                println!("🔄 Resumed {started} identity clients");
                            }
                            Err(e) => eprintln!("⚠️ Identity bootstrap failed: {e}"),
                        }

                        if !our_webhook_url.is_empty() {
                            match agent_service
                                .ensure_webhook(&our_webhook_url, &webhook_secret)
                                .await
                            {
                                Ok(_) => println!("🔗 Agent-service webhook registered"),
                                Err(e) => {
                                    eprintln!("⚠️ Webhook registration failed: {e}")
                                }
                            }
                        }

                        // Enumerate agents and make sure each has an
                        // identity, a live client, and a room in the space.
                        sync_agent_rooms(&identities, &pool, &orchestrator, &agent_service).await;
                    });
                })
            }
        }))
        .attach(rocket::fairing::AdHoc::on_liftoff("Session Proxy", {
            let config = config.clone();
            let tracker = tracker.clone();
            move |_rocket| {
                Box::pin(async move {
                    if config.proxy_port == 0 {
                        return;
                    }
                    let proxy = proxy::build_proxy_rocket(&config, tracker);
                    tokio::spawn(async move {
                        if let Err(e) = proxy.launch().await {
                            eprintln!("⚠️ Session proxy failed: {e}");
                        }
                    });
                    println!("🔀 Session proxy started on port {}", config.proxy_port);
                })
            }
        }))
        .attach(rocket::fairing::AdHoc::on_shutdown("Graceful Stop", {
            let pool = pool.clone();
            let monitors = monitors.clone();
            let storage = storage.clone();
            move |_rocket| {
                Box::pin(async move {
                    monitors.cancel_all();
                    pool.stop_all();
                    storage.flush().await;
                    println!("👋 Bridge stopped");
                })
            }
        }))
}

/// Give every agent on the platform an identity, a pool client, and a room
/// under the space. Failures are logged per agent; the bridge serves
/// whatever subset came up.
async fn sync_agent_rooms(
    identities: &Arc<IdentityManager>,
    pool: &Arc<ClientPool>,
    orchestrator: &Arc<RoomOrchestrator>,
    agent_service: &Arc<AgentServiceClient>,
) {
    let caller = match identities
        .get_or_create(
            models::IdentityKind::Custom,
            "bridge_bot",
            "Agent Bridge",
            None,
        )
        .await
    {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("⚠️ Bridge bot unavailable, skipping agent sync: {e}");
            return;
        }
    };
    if let Err(e) = pool.acquire(&caller).await {
        eprintln!("⚠️ Bridge bot client failed: {e}");
        return;
    }

    let agents = match agent_service.list_agents().await {
        Ok(agents) => agents,
        Err(e) => {
            eprintln!("⚠️ Agent listing failed, skipping room sync: {e}");
            return;
        }
    };

    let mut ready = 0usize;
    for agent in &agents {
        let name = if agent.name.is_empty() {
            agent.id.clone()
        } else {
            agent.name.clone()
        };
        match orchestrator
            .get_or_create_agent_room(&agent.id, &name, &caller)
            .await
        {
            Ok(_) => ready += 1,
            Err(e) => eprintln!("⚠️ Room setup failed for {}: {e}", agent.id),
        }
    }
    println!("🏠 {ready}/{} agent rooms ready", agents.len());
}
