use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{
    api::JsonResult,
    auth::{encode_jwt, generate_login_claims, AdminHeaders},
    cache::EVENT_CACHE,
    db::{
        models::{AuditEvent, Program, ProgramPurchase, User, UserRole},
        DbConn,
    },
};

/// Provisioning and operations endpoints: accounts, programs and completed
/// purchases are normally produced by the surrounding platform, but an
/// administrator can create them directly so a fresh install is usable on
/// its own.
pub fn routes() -> Vec<Route> {
    routes![create_user, delete_user, issue_token, create_program, record_purchase, get_event_audit, purge_cache]
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewUserData {
    email: String,
    name: String,
    role: Option<String>,
    is_verified: Option<bool>,
}

#[post("/users", data = "<data>")]
async fn create_user(data: Json<NewUserData>, _headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let data: NewUserData = data.into_inner();

    if User::find_by_mail(&data.email, &conn).await.is_some() {
        err_kind!(Duplicate, "A user with this email already exists");
    }

    let mut user = User::new(data.email, data.name.trim().to_string());
    if let Some(role) = &data.role {
        match UserRole::from_str(role) {
            Some(level) => user.atype = level as i32,
            None => err_kind!(Validation, format!("Unknown authorization level {role}")),
        }
    }
    user.is_verified = data.is_verified.unwrap_or(false);
    user.save(&conn).await?;

    Ok(Json(user.to_json()))
}

#[delete("/users/<user_id>")]
async fn delete_user(user_id: &str, headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let Some(user) = User::find_by_uuid(user_id, &conn).await else {
        err_kind!(NotFound, "User not found");
    };
    if user.uuid == headers.user.uuid {
        err_kind!(Validation, "You cannot delete your own account");
    }

    user.delete(&conn).await?;
    Ok(Json(json!({ "deleted": true })))
}

/// Mints a bearer token for the given user. Session issuance normally lives
/// in the identity layer; this exists for provisioning and integration
/// checks against a standalone install.
#[post("/users/<user_id>/token")]
async fn issue_token(user_id: &str, _headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let Some(user) = User::find_by_uuid(user_id, &conn).await else {
        err_kind!(NotFound, "User not found");
    };

    let claims = generate_login_claims(&user);
    Ok(Json(json!({
        "accessToken": encode_jwt(&claims),
        "expiresAt": claims.exp,
        "userId": user.uuid,
        "object": "token",
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewProgramData {
    title: String,
    is_free: Option<bool>,
    mentors: Option<Vec<String>>,
}

#[post("/programs", data = "<data>")]
async fn create_program(data: Json<NewProgramData>, _headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let data: NewProgramData = data.into_inner();

    let title = data.title.trim().to_string();
    if title.is_empty() {
        err_kind!(Validation, "A program needs a title");
    }

    let mut program = Program::new(title, data.is_free.unwrap_or(false));
    if let Some(mentors) = &data.mentors {
        program.mentors = serde_json::to_string(mentors)?;
    }
    program.save(&conn).await?;

    Ok(Json(program.to_json()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewPurchaseData {
    user_id: String,
}

/// Records an externally completed purchase, which grants the user access to
/// the program for event linkage.
#[post("/programs/<program_id>/purchases", data = "<data>")]
async fn record_purchase(program_id: &str, data: Json<NewPurchaseData>, _headers: AdminHeaders, conn: DbConn) -> JsonResult {
    let data: NewPurchaseData = data.into_inner();

    let Some(program) = Program::find_by_uuid(program_id, &conn).await else {
        err_kind!(NotFound, "Program not found");
    };
    let Some(user) = User::find_by_uuid(&data.user_id, &conn).await else {
        err_kind!(NotFound, "User not found");
    };

    let purchase = ProgramPurchase::new(program.uuid.clone(), user.uuid.clone());
    purchase.save(&conn).await?;

    Ok(Json(json!({
        "id": purchase.uuid,
        "programId": program.uuid,
        "userId": user.uuid,
        "isCompleted": purchase.is_completed,
        "object": "programPurchase",
    })))
}

#[get("/events/<event_id>/audit")]
async fn get_event_audit(event_id: &str, _headers: AdminHeaders, conn: DbConn) -> Json<Value> {
    let entries: Vec<Value> =
        AuditEvent::find_by_event(event_id, &conn).await.iter().map(AuditEvent::to_json).collect();

    Json(json!({
        "events": entries,
        "object": "list",
    }))
}

#[post("/cache/purge")]
fn purge_cache(_headers: AdminHeaders) -> Json<Value> {
    EVENT_CACHE.clear();
    Json(json!({ "purged": true }))
}
