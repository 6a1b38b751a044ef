use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use chat_dispatch::accounts::AccountsManager;
use chat_dispatch::config::{Config, EnvSettings, UnwrapFailure};
use chat_dispatch::dispatch::DispatchManager;
use chat_dispatch::group::events::GroupUserEventSubscription;
use chat_dispatch::group::{
    GroupMessageSubscriber, ImServerManager, KeyedExecutor, OnlineMemberManager,
    OnlineMessageHandler,
};
use chat_dispatch::messages::MessagesManager;
use chat_dispatch::metrics::Metrics;
use chat_dispatch::offline::http::InternalState;
use chat_dispatch::offline::lease::DEFAULT_LEASE_TTL_MS;
use chat_dispatch::offline::member_mgr::GroupMemberMgr;
use chat_dispatch::offline::peers::HttpPeerPoster;
use chat_dispatch::offline::{MasterLeaseAgent, OfflinePushService, OfflineServerRegistry};
use chat_dispatch::push::router::PushRouter;
use chat_dispatch::push::vendors::{ApnsVendor, FcmVendor, UmengVendor};
use chat_dispatch::push::{PushService, PushType, PushVendor};
use dao::memory::MemoryDao;
use futures::StreamExt;
use online_redis::{OnlineRedisManager, RedisDbPool};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::{info, Level};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let settings = EnvSettings::new();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(settings.parse("log-level").unwrap_or(Level::INFO))
            .finish(),
    )
    .failed_to("set default subscriber");

    let config_path = settings
        .get("config")
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&config_path).failed_to("load configuration");

    let metrics = Arc::new(Metrics::new());

    // The presence pool and the group pool stay separate; every call
    // routes with an explicit hash key.
    let online_bus = Arc::new(
        OnlineRedisManager::new(&config.online_redis, metrics.clone())
            .failed_to("initialize online redis manager"),
    );
    online_bus.start();
    let group_bus = Arc::new(
        OnlineRedisManager::new(&config.group_redis, metrics.clone())
            .failed_to("initialize group redis manager"),
    );
    group_bus.start();
    let db_pool = RedisDbPool::new(&config.redis_db);

    let dao = Arc::new(MemoryDao::new());
    let accounts_manager = AccountsManager::new(dao.clone());
    let messages_manager = MessagesManager::new(dao.clone());

    let mut vendors: HashMap<PushType, Arc<dyn PushVendor>> = HashMap::new();
    for name in &config.offline.push_types {
        let push_type = PushType::parse(name)
            .failed_to(&format!("recognize push type '{}'", name));
        let vendor: Arc<dyn PushVendor> = match push_type {
            PushType::Apns => Arc::new(ApnsVendor::new(config.push.apns_endpoint.clone())),
            PushType::Fcm => Arc::new(FcmVendor::new(config.push.fcm_endpoint.clone())),
            PushType::Umeng => Arc::new(UmengVendor::new(config.push.umeng_endpoint.clone())),
        };
        vendors.insert(push_type, vendor);
    }
    let push_service = PushService::new(vendors, db_pool.clone());

    let registry = OfflineServerRegistry::new(db_pool.clone());
    registry.advertise(
        config.offline.server_addr.clone(),
        push_service.handled_types(),
    );
    let poster = Arc::new(HttpPeerPoster::new());
    let push_router = PushRouter::new(push_service.clone(), registry.clone(), poster.clone());

    let dispatch_manager = DispatchManager::new(
        config.dispatcher.clone(),
        config.encrypt_sender.clone(),
        online_bus.clone(),
        db_pool.clone(),
        messages_manager,
        dao.clone(),
        push_router,
        metrics.clone(),
    );
    dispatch_manager.start();

    // Online group fan-out.
    let executor = Arc::new(KeyedExecutor::new(config.offline.event_threads));
    let member_manager = OnlineMemberManager::new(dao.clone(), executor.clone());
    let subscriber = GroupMessageSubscriber::new(group_bus.clone());
    member_manager.set_subscriber(subscriber.clone());
    dispatch_manager.register_user_status_listener(member_manager.clone());
    let online_handler = OnlineMessageHandler::new(
        dispatch_manager.clone(),
        member_manager.clone(),
        config.noise.clone(),
        db_pool.clone(),
        executor.clone(),
    );
    subscriber.add_handler(online_handler);
    subscriber.start();

    let group_events = GroupUserEventSubscription::new(group_bus.clone());
    group_events.add_listener(member_manager.clone());
    group_events.start();

    // Periodic online-user gauge.
    {
        let manager = dispatch_manager.clone();
        let members = member_manager.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                metrics.mark(
                    "onlineUserMetrics",
                    "onlineDeviceCount",
                    manager.channel_count() as i64,
                    0,
                );
                metrics.mark(
                    "onlineUserMetrics",
                    "onlineUidCount",
                    members.online_user_count() as i64,
                    0,
                );
            }
        });
    }

    // Peer-server presence.
    let self_addr = settings
        .get("server-addr")
        .unwrap_or_else(|| config.offline.server_addr.clone());
    if let Some(node) = config
        .online_redis
        .values()
        .next()
        .and_then(|nodes| nodes.first())
    {
        let im_servers = ImServerManager::new(node.clone(), self_addr);
        im_servers.start();
    }

    // Offline push round under the master lease.
    let offline_members = GroupMemberMgr::new(dao.clone(), executor.clone());
    group_events.add_listener(offline_members.clone());
    let lease = MasterLeaseAgent::new(
        db_pool.clone(),
        format!("offline_redis_{}", config.offline.redis_partition),
        DEFAULT_LEASE_TTL_MS,
        Some(Box::new(|| info!("offline push lease lost"))),
    );
    lease.start();
    let offline_service = OfflinePushService::new(
        config.offline.clone(),
        db_pool.clone(),
        accounts_manager.clone(),
        dao.clone(),
        offline_members,
        push_service.clone(),
        registry.clone(),
        poster,
        lease.clone(),
    );
    offline_service.start();

    // Internal inter-server endpoints.
    let listen = settings.parse_socketaddr("internal-listen", "127.0.0.1:8200");
    let state = web::Data::new(InternalState {
        push_service: push_service.clone(),
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(chat_dispatch::offline::http::configure)
    })
    .bind(listen)?
    .run();
    let server_handle = server.handle();
    actix_web::rt::spawn(server);

    info!(
        "message dispatch server v{} started, internal listener on {}",
        env!("CARGO_PKG_VERSION"),
        listen
    );

    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;
    while let Some(signal) = signals.next().await {
        match signal {
            SIGHUP => {
                // Reload configuration
            }
            SIGTERM | SIGINT | SIGQUIT => {
                info!(
                    "shutting down message dispatch server v{}...",
                    env!("CARGO_PKG_VERSION")
                );

                server_handle.stop(true).await;
                lease.stop().await;

                // Let in-flight channel work settle before exit.
                tokio::time::sleep(Duration::from_secs(1)).await;
                break;
            }
            _ => unreachable!(),
        }
    }

    Ok(())
}
