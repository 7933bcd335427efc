use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, LazyLock,
    },
    time::Duration,
};

use dashmap::DashMap;
use rocket::Route;
use rocket_ws::Message;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{auth::Headers, CONFIG};

/// Topic-per-event fan-out registry. Delivery is at-most-once: messages to a
/// topic nobody subscribes to are dropped, and subscribers that lag behind
/// the bounded buffer are disconnected.
pub static WS_EVENTS: LazyLock<Arc<EventTopics>> = LazyLock::new(|| Arc::new(EventTopics::new()));

pub fn routes() -> Vec<Route> {
    if CONFIG.enable_websocket() {
        routes![events_ws]
    } else {
        info!("Websocket notifications are disabled");
        routes![]
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateType {
    UserSignedUp,
    UserCancelled,
    UserRemoved,
    UserMoved,
    UserAssigned,
    WorkshopTopicUpdated,
    EventUpdated,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::UserSignedUp => "user_signed_up",
            UpdateType::UserCancelled => "user_cancelled",
            UpdateType::UserRemoved => "user_removed",
            UpdateType::UserMoved => "user_moved",
            UpdateType::UserAssigned => "user_assigned",
            UpdateType::WorkshopTopicUpdated => "workshop_topic_updated",
            UpdateType::EventUpdated => "event_updated",
        }
    }
}

pub struct EventTopics {
    topics: DashMap<String, broadcast::Sender<String>>,
    dropped_subscribers: AtomicU64,
}

impl EventTopics {
    fn new() -> Self {
        Self {
            topics: DashMap::new(),
            dropped_subscribers: AtomicU64::new(0),
        }
    }

    fn sender(&self, event_uuid: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(event_uuid.to_string())
            .or_insert_with(|| broadcast::channel(CONFIG.ws_buffer_size()).0)
            .value()
            .clone()
    }

    pub fn subscribe(&self, event_uuid: &str) -> broadcast::Receiver<String> {
        self.sender(event_uuid).subscribe()
    }

    /// Emits a typed message carrying the change kind, the primary ids and a
    /// freshly built event view suitable for UI replacement. Called after
    /// commit, in commit order per `(event, role)`.
    pub fn send_event_update(
        &self,
        ut: UpdateType,
        event_uuid: &str,
        user_uuid: Option<&str>,
        role_uuid: Option<&str>,
        event_view: Value,
    ) {
        if !CONFIG.enable_websocket() {
            return;
        }

        let frame = json!({
            "type": ut.as_str(),
            "eventId": event_uuid,
            "userId": user_uuid,
            "roleId": role_uuid,
            "event": event_view,
        })
        .to_string();

        // An Err here only means there are no subscribers right now.
        if let Some(sender) = self.topics.get(event_uuid) {
            let _ = sender.send(frame);
        }
    }

    /// Topics with no subscribers and no senders besides the registry entry
    /// can be dropped; the periodic sweeps call this.
    pub fn shrink(&self) {
        self.topics.retain(|_, tx| tx.receiver_count() > 0);
    }

    fn note_dropped_subscriber(&self) {
        self.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_subscribers(&self) -> u64 {
        self.dropped_subscribers.load(Ordering::Relaxed)
    }
}

#[get("/events/<event_id>")]
fn events_ws(event_id: String, _headers: Headers, ws: rocket_ws::WebSocket) -> rocket_ws::Stream!['static] {
    let mut rx = WS_EVENTS.subscribe(&event_id);

    rocket_ws::Stream! { ws => {
        let _ws = ws;
        let mut ping_timer = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                res = rx.recv() => {
                    match res {
                        Ok(text) => yield Message::Text(text),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // This subscriber fell behind the bounded buffer;
                            // per the at-most-once contract it gets dropped
                            // instead of replayed.
                            warn!("Dropping lagging websocket subscriber of event {event_id} ({skipped} messages behind)");
                            WS_EVENTS.note_dropped_subscriber();
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ping_timer.tick() => {
                    yield Message::Ping(Vec::new());
                }
            }
        }
    }}
}
