mod admin;
pub mod events;
mod registrations;
mod system_messages;

pub use events::{audit_cleanup_job, counter_sweep_job, status_sweep_job};

use rocket::serde::json::Json;
use serde_json::Value;

use crate::{api::WS_EVENTS, auth::AdminHeaders, cache::EVENT_CACHE, dispatch, locks::SIGNUP_LOCKS};

pub fn routes() -> Vec<rocket::Route> {
    let mut routes = routes![alive, metrics];
    routes.append(&mut admin::routes());
    routes.append(&mut events::routes());
    routes.append(&mut registrations::routes());
    routes.append(&mut system_messages::routes());
    routes
}

#[get("/alive")]
fn alive() -> Json<String> {
    Json(crate::util::format_date(&chrono::Utc::now().naive_utc()))
}

#[get("/metrics")]
fn metrics(_headers: AdminHeaders) -> Json<Value> {
    Json(json!({
        "cache": EVENT_CACHE.metrics(),
        "realtime": {
            "droppedSubscribers": WS_EVENTS.dropped_subscribers(),
        },
        "sideEffects": {
            "failed": dispatch::failed_effects(),
        },
        "locks": {
            "tracked": SIGNUP_LOCKS.len(),
        },
        "object": "metrics",
    }))
}
