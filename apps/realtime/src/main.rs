use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fitra_realtime::bus::supervisor::SupervisorStatus;
use fitra_realtime::bus::transport::WebSocketConnector;
use fitra_realtime::chat::HttpChatApi;
use fitra_realtime::config::Config;
use fitra_realtime::RealtimeSession;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(bus_url = %config.bus_url, api_url = %config.api_url, "fitra-notify configured");

    let connector = Arc::new(WebSocketConnector::new(&config.bus_url));
    let api = Arc::new(HttpChatApi::new(&config.api_url, &config.auth_token));

    let session = match RealtimeSession::login(config, connector, api).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(%err, "login failed");
            std::process::exit(1);
        }
    };

    match session.chat.load_rooms().await {
        Ok(rooms) => {
            for room in &rooms {
                tracing::info!(
                    room_id = room.id,
                    counterpart = room.counterpart.id,
                    unread = room.unread,
                    preview = %room.preview(session.config.user_id).unwrap_or_default(),
                    "chat room"
                );
            }
        }
        Err(err) => tracing::warn!(%err, "could not load chat rooms"),
    }

    let mut badge = session.aggregator.watch();
    let mut status = session.supervisor.watch_status();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = badge.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = badge.borrow_and_update().clone();
                let counters: Vec<String> = snapshot
                    .counters
                    .iter()
                    .map(|(source, count)| format!("{source}={count}"))
                    .collect();
                tracing::info!(total = snapshot.total, counters = %counters.join(" "), "badge");
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                match current {
                    SupervisorStatus::AuthRejected => {
                        tracing::error!("credential rejected; log in again");
                        break;
                    }
                    SupervisorStatus::GaveUp { attempts } => {
                        tracing::error!(attempts, "broker unreachable; giving up");
                        break;
                    }
                    other => tracing::info!(status = ?other, "bus status"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    session.logout();
}
