use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{
    api::{EmptyResult, JsonResult, UpdateType, WS_EVENTS},
    auth::{decode_decline, encode_jwt, generate_decline_claims, Headers},
    cache::{event_tag, EVENT_CACHE, TAG_ANALYTICS},
    db::{
        models::{workshop_group_leader_role, Event, EventRole, EventStatus, Registration, User, WORKSHOP_EVENT_TYPE, WORKSHOP_GROUPS},
        DbConn,
    },
    dispatch::{dispatch, SideEffect},
    error::Error,
    locks::{signup_lock_key, SIGNUP_LOCKS},
    CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![signup, cancel, assign, move_between_roles, remove, workshop_topic, decline, my_registrations]
}

/// The caller's own registrations across all events.
#[get("/registrations/mine")]
async fn my_registrations(headers: Headers, conn: DbConn) -> Json<Value> {
    let registrations: Vec<Value> =
        Registration::find_by_user(&headers.user.uuid, &conn).await.iter().map(Registration::to_json).collect();

    Json(json!({
        "registrations": registrations,
        "object": "list",
    }))
}

//
// Shared pre-flight checks
//

/// Resolves the event or fails `NotFound`.
async fn resolve_event(event_id: &str, conn: &DbConn) -> Result<Event, Error> {
    match Event::find_by_uuid(event_id, conn).await {
        Some(event) => Ok(event),
        None => err_kind!(NotFound, "Event not found"),
    }
}

/// Resolves a role within the event or fails `NotFound`.
async fn resolve_role(event: &Event, role_id: &str, conn: &DbConn) -> Result<EventRole, Error> {
    match EventRole::find_by_uuid_and_event(role_id, &event.uuid, conn).await {
        Some(role) => Ok(role),
        None => err_kind!(NotFound, "Role not found on this event"),
    }
}

/// Registrations can only be created while the event is still upcoming.
fn check_upcoming(event: &Event) -> EmptyResult {
    let status = event.derived_status(chrono::Utc::now());
    if status != EventStatus::Upcoming {
        err_kind!(InvalidState, format!("Signups are closed, this event is {}", status.as_str()));
    }
    Ok(())
}

/// Per-event role quota for the user's authorization level.
async fn check_role_quota(user: &User, event_uuid: &str, conn: &DbConn) -> EmptyResult {
    if let Some(quota) = user.role_quota() {
        let held = Registration::count_by_user_and_event(&user.uuid, event_uuid, conn).await;
        if held >= quota {
            err_kind!(
                QuotaExceeded,
                format!("As a {}, you can hold at most {} roles in one event", user.role().as_str(), quota)
            );
        }
    }
    Ok(())
}

async fn role_is_full(event_uuid: &str, role: &EventRole, conn: &DbConn) -> bool {
    Registration::count_by_event_and_role(event_uuid, &role.uuid, conn).await >= i64::from(role.max_participants)
}

/// Post-commit propagation shared by every engine operation: caches first,
/// then the realtime frame carrying a freshly built event view.
async fn propagate(ut: UpdateType, event: &Event, user_uuid: Option<&str>, role_uuid: Option<&str>, conn: &DbConn) -> Value {
    EVENT_CACHE.invalidate_by_tags(&[&event_tag(&event.uuid), TAG_ANALYTICS]);

    let view = event.to_json(conn).await;
    WS_EVENTS.send_event_update(ut, &event.uuid, user_uuid, role_uuid, view.clone());
    view
}

//
// Signup
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignupData {
    role_id: String,
    notes: Option<String>,
    special_requirements: Option<String>,
}

#[post("/events/<event_id>/signup", data = "<data>")]
async fn signup(event_id: &str, data: Json<SignupData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data: SignupData = data.into_inner();
    let user = headers.user;

    let mut event = resolve_event(event_id, &conn).await?;
    let role = resolve_role(&event, &data.role_id, &conn).await?;
    check_upcoming(&event)?;

    if !user.is_active || !user.is_verified {
        err_kind!(Unauthorized, "Your account must be active and verified to sign up");
    }

    check_role_quota(&user, &event.uuid, &conn).await?;

    // Deterministic error without taking the lock; the authoritative check
    // is repeated inside the critical section.
    if role_is_full(&event.uuid, &role, &conn).await {
        err_kind!(CapacityFull, format!("The {} role is already full", role.name));
    }

    {
        let _guard =
            SIGNUP_LOCKS.acquire(&signup_lock_key(&event.uuid, &role.uuid), CONFIG.signup_lock_timeout_ms()).await?;

        // Recount straight off the store now that we own the section.
        if role_is_full(&event.uuid, &role, &conn).await {
            err_kind!(CapacityFull, format!("The {} role is already full", role.name));
        }

        if Registration::find_by_event_user_role(&event.uuid, &user.uuid, &role.uuid, &conn).await.is_some() {
            err_kind!(Duplicate, "You are already signed up for this role");
        }

        let registration =
            Registration::new(&event, &role, &user, &user.uuid, data.notes, data.special_requirements);
        if let Err(e) = registration.insert(&conn).await {
            // A concurrent writer on another process can win the unique
            // index even though we hold the in-process lock.
            if e.is_unique_violation() {
                err_kind!(Duplicate, "You are already signed up for this role");
            }
            return Err(e);
        }

        event.save(&conn).await?;
    }

    let view = propagate(UpdateType::UserSignedUp, &event, Some(&user.uuid), Some(&role.uuid), &conn).await;

    dispatch(SideEffect::SignupConfirmed {
        event_uuid: event.uuid.clone(),
        user_uuid: user.uuid.clone(),
        role_name: role.name.clone(),
    });

    Ok(Json(json!({ "event": view })))
}

//
// Cancel
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelData {
    role_id: String,
}

#[post("/events/<event_id>/cancel", data = "<data>")]
async fn cancel(event_id: &str, data: Json<CancelData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data: CancelData = data.into_inner();
    let user = headers.user;

    let mut event = resolve_event(event_id, &conn).await?;
    if event.derived_status(chrono::Utc::now()) == EventStatus::Cancelled {
        err_kind!(InvalidState, "Registrations of a cancelled event are read-only");
    }
    let role = resolve_role(&event, &data.role_id, &conn).await?;

    if !Registration::delete_by_event_user_role(&event.uuid, &user.uuid, &role.uuid, &conn).await? {
        err_kind!(NotFound, "You are not registered for this role");
    }

    event.save(&conn).await?;

    let view = propagate(UpdateType::UserCancelled, &event, Some(&user.uuid), Some(&role.uuid), &conn).await;

    dispatch(SideEffect::RegistrationCancelled {
        event_uuid: event.uuid.clone(),
        user_uuid: user.uuid.clone(),
        role_name: role.name.clone(),
        actor_uuid: user.uuid.clone(),
    });

    Ok(Json(json!({ "event": view })))
}

//
// Organizer removal
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveData {
    user_id: String,
    role_id: String,
}

#[post("/events/<event_id>/remove", data = "<data>")]
async fn remove(event_id: &str, data: Json<RemoveData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data: RemoveData = data.into_inner();
    let actor = headers.user;

    let mut event = resolve_event(event_id, &conn).await?;
    if !event.is_organizer(&actor.uuid) && !actor.can_moderate_participants() {
        err_kind!(Forbidden, "Only organizers can remove participants");
    }
    if event.derived_status(chrono::Utc::now()) == EventStatus::Cancelled {
        err_kind!(InvalidState, "Registrations of a cancelled event are read-only");
    }
    let role = resolve_role(&event, &data.role_id, &conn).await?;

    if !Registration::delete_by_event_user_role(&event.uuid, &data.user_id, &role.uuid, &conn).await? {
        err_kind!(NotFound, "This user is not registered for this role");
    }

    event.save(&conn).await?;

    let view = propagate(UpdateType::UserRemoved, &event, Some(&data.user_id), Some(&role.uuid), &conn).await;

    dispatch(SideEffect::UserRemoved {
        event_uuid: event.uuid.clone(),
        user_uuid: data.user_id.clone(),
        role_name: role.name.clone(),
        actor_uuid: actor.uuid.clone(),
    });

    Ok(Json(json!({ "event": view })))
}

//
// Move between roles
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveData {
    user_id: String,
    from_role_id: String,
    to_role_id: String,
}

#[post("/events/<event_id>/move", data = "<data>")]
async fn move_between_roles(event_id: &str, data: Json<MoveData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data: MoveData = data.into_inner();
    let actor = headers.user;

    let mut event = resolve_event(event_id, &conn).await?;
    let moving_self = actor.uuid == data.user_id;
    if !moving_self && !event.is_organizer(&actor.uuid) && !actor.can_moderate_participants() {
        err_kind!(Forbidden, "Only organizers can move other participants");
    }
    let from_role = resolve_role(&event, &data.from_role_id, &conn).await?;
    let to_role = resolve_role(&event, &data.to_role_id, &conn).await?;
    check_upcoming(&event)?;

    let Some(mut registration) =
        Registration::find_by_event_user_role(&event.uuid, &data.user_id, &from_role.uuid, &conn).await
    else {
        err_kind!(NotFound, "This user is not registered for the source role")
    };

    if role_is_full(&event.uuid, &to_role, &conn).await {
        err_kind!(CapacityFull, format!("The {} role is already full", to_role.name));
    }

    {
        let _guard = SIGNUP_LOCKS
            .acquire(&signup_lock_key(&event.uuid, &to_role.uuid), CONFIG.signup_lock_timeout_ms())
            .await?;

        if role_is_full(&event.uuid, &to_role, &conn).await {
            err_kind!(CapacityFull, format!("The {} role is already full", to_role.name));
        }

        registration.move_to_role(&to_role, &actor.uuid, &from_role.name);
        if registration.update(&conn).await.is_err() {
            // A write conflict here means someone raced us into the target
            // role; the caller sees it the same way as a failed recheck.
            err_kind!(CapacityFull, format!("The {} role is already full", to_role.name));
        }
    }

    event.save(&conn).await?;

    let view = propagate(UpdateType::UserMoved, &event, Some(&data.user_id), Some(&to_role.uuid), &conn).await;

    dispatch(SideEffect::UserMoved {
        event_uuid: event.uuid.clone(),
        user_uuid: data.user_id.clone(),
        from_role_name: from_role.name.clone(),
        to_role_name: to_role.name.clone(),
        actor_uuid: actor.uuid.clone(),
    });

    Ok(Json(json!({ "event": view })))
}

//
// Organizer assignment
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignData {
    user_id: String,
    role_id: String,
    notes: Option<String>,
    special_requirements: Option<String>,
    suppress_notifications: Option<bool>,
}

#[post("/events/<event_id>/assign", data = "<data>")]
async fn assign(event_id: &str, data: Json<AssignData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data: AssignData = data.into_inner();
    let actor = headers.user;

    let mut event = resolve_event(event_id, &conn).await?;
    if !event.is_organizer(&actor.uuid) && !actor.can_moderate_participants() {
        err_kind!(Forbidden, "Only organizers can assign participants");
    }
    let role = resolve_role(&event, &data.role_id, &conn).await?;
    check_upcoming(&event)?;

    let Some(target) = User::find_by_uuid(&data.user_id, &conn).await else {
        err_kind!(NotFound, "User not found")
    };
    if !target.is_active || !target.is_verified {
        err_kind!(Validation, "Only active and verified users can be assigned to a role");
    }

    // Idempotent: assigning an already assigned user is a success and emits
    // no side effects.
    if Registration::find_by_event_user_role(&event.uuid, &target.uuid, &role.uuid, &conn).await.is_some() {
        let view = event.to_json(&conn).await;
        return Ok(Json(json!({ "event": view })));
    }

    check_role_quota(&target, &event.uuid, &conn).await?;

    if role_is_full(&event.uuid, &role, &conn).await {
        err_kind!(CapacityFull, format!("The {} role is already full", role.name));
    }

    let registration;
    {
        let _guard =
            SIGNUP_LOCKS.acquire(&signup_lock_key(&event.uuid, &role.uuid), CONFIG.signup_lock_timeout_ms()).await?;

        if role_is_full(&event.uuid, &role, &conn).await {
            err_kind!(CapacityFull, format!("The {} role is already full", role.name));
        }

        registration =
            Registration::new(&event, &role, &target, &actor.uuid, data.notes, data.special_requirements);
        if let Err(e) = registration.insert(&conn).await {
            if e.is_unique_violation() {
                // Lost the race to a concurrent assignment; idempotent success.
                let view = event.to_json(&conn).await;
                return Ok(Json(json!({ "event": view })));
            }
            return Err(e);
        }

        event.save(&conn).await?;
    }

    let view = propagate(UpdateType::UserAssigned, &event, Some(&target.uuid), Some(&role.uuid), &conn).await;

    if !data.suppress_notifications.unwrap_or(false) {
        let decline_token = encode_jwt(&generate_decline_claims(registration.uuid.clone(), target.uuid.clone()));
        dispatch(SideEffect::RoleInvitation {
            event_uuid: event.uuid.clone(),
            user_uuid: target.uuid.clone(),
            role_name: role.name.clone(),
            actor_uuid: actor.uuid.clone(),
            decline_token,
        });
    }

    Ok(Json(json!({ "event": view })))
}

//
// Workshop group topics
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicData {
    topic: String,
}

#[post("/events/<event_id>/workshop-topic/<group>", data = "<data>")]
async fn workshop_topic(event_id: &str, group: &str, data: Json<TopicData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data: TopicData = data.into_inner();
    let actor = headers.user;

    let mut event = resolve_event(event_id, &conn).await?;
    if event.event_type != WORKSHOP_EVENT_TYPE {
        err_kind!(Validation, "Group topics only exist on communication workshops");
    }

    let group = group.to_uppercase();
    if !WORKSHOP_GROUPS.contains(&group.as_str()) {
        err_kind!(Validation, "Unknown workshop group");
    }

    if !can_edit_group_topic(&actor, &event, &group, &conn).await {
        err_kind!(Forbidden, "You cannot edit this group's topic");
    }

    event.set_group_topic(&group, &data.topic);
    event.save(&conn).await?;

    let view = propagate(UpdateType::WorkshopTopicUpdated, &event, None, None, &conn).await;

    dispatch(SideEffect::WorkshopTopicUpdated {
        event_uuid: event.uuid.clone(),
        group,
        actor_uuid: actor.uuid.clone(),
    });

    Ok(Json(json!({ "event": view })))
}

/// Admins, the creator, co-organizers, and the registered leader of the
/// group itself may set its topic.
async fn can_edit_group_topic(actor: &User, event: &Event, group: &str, conn: &DbConn) -> bool {
    if actor.can_moderate_participants() || event.is_organizer(&actor.uuid) {
        return true;
    }

    let leader_role = workshop_group_leader_role(group);
    let roles = EventRole::find_by_event(&event.uuid, conn).await;
    let Some(role) = roles.iter().find(|r| r.name == leader_role) else {
        return false;
    };
    Registration::find_by_event_user_role(&event.uuid, &actor.uuid, &role.uuid, conn).await.is_some()
}

//
// Invitation decline (unauthenticated, token-bound)
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeclineData {
    token: String,
}

#[post("/registrations/decline", data = "<data>")]
async fn decline(data: Json<DeclineData>, conn: DbConn) -> JsonResult {
    let data: DeclineData = data.into_inner();

    let Ok(claims) = decode_decline(&data.token) else {
        err_kind!(Validation, "The decline link is invalid or has expired");
    };

    // Declining twice, or after removal, is a no-op success.
    let Some(registration) = Registration::find_by_uuid(&claims.registration_uuid, &conn).await else {
        return Ok(Json(json!({ "declined": true })));
    };
    if registration.user_uuid != claims.sub {
        err_kind!(Validation, "The decline link does not match this registration");
    }

    let Some(mut event) = Event::find_by_uuid(&registration.event_uuid, &conn).await else {
        return Ok(Json(json!({ "declined": true })));
    };

    let role_name = match EventRole::find_by_uuid_and_event(&registration.role_uuid, &event.uuid, &conn).await {
        Some(role) => role.name,
        None => String::from("unknown"),
    };

    let (user_uuid, role_uuid) = (registration.user_uuid.clone(), registration.role_uuid.clone());
    registration.delete(&conn).await?;
    event.save(&conn).await?;

    propagate(UpdateType::UserCancelled, &event, Some(&user_uuid), Some(&role_uuid), &conn).await;

    dispatch(SideEffect::InvitationDeclined {
        event_uuid: event.uuid.clone(),
        user_uuid,
        role_name,
    });

    Ok(Json(json!({ "declined": true })))
}
