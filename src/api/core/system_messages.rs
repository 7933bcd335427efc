use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{
    api::JsonResult,
    auth::Headers,
    db::{models::SystemMessage, DbConn},
};

pub fn routes() -> Vec<Route> {
    routes![get_system_messages, read_system_message]
}

#[get("/system-messages")]
async fn get_system_messages(headers: Headers, conn: DbConn) -> Json<Value> {
    let messages: Vec<Value> =
        SystemMessage::find_by_user(&headers.user.uuid, &conn).await.iter().map(SystemMessage::to_json).collect();

    Json(json!({
        "messages": messages,
        "object": "list",
    }))
}

#[post("/system-messages/<message_id>/read")]
async fn read_system_message(message_id: &str, headers: Headers, conn: DbConn) -> JsonResult {
    let Some(mut message) = SystemMessage::find_by_uuid_and_user(message_id, &headers.user.uuid, &conn).await else {
        err_kind!(NotFound, "Message not found");
    };

    if message.read_at.is_none() {
        message.mark_read(&conn).await?;
    }

    Ok(Json(message.to_json()))
}
