use std::cmp::Ordering;
use std::time::Duration;

use chrono::Utc;
use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{
    api::{EmptyResult, JsonResult, UpdateType, WS_EVENTS},
    auth::Headers,
    cache::{event_tag, EVENT_CACHE, TAG_ANALYTICS, TAG_EVENTS, TAG_LISTINGS},
    db::{
        models::{
            AuditEvent, AuditEventType, Event, EventFormat, EventProgram, EventRole, EventStatus, GuestRegistration,
            OrganizerDetail, Program, Registration, User, UserRole,
        },
        DbConn, DbPool,
    },
    dispatch::{dispatch, SideEffect},
    error::{Error, Kind},
    locks::SIGNUP_LOCKS,
    util::trim_to_option,
    CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![
        get_events,
        get_event,
        create_event,
        update_event,
        delete_event,
        time_conflict,
        has_registrations,
        availability,
    ]
}

//
// Listing
//

#[derive(FromForm, Default)]
struct ListingFilters {
    status: Option<String>,
    statuses: Option<String>,
    #[field(name = "type")]
    event_type: Option<String>,
    #[field(name = "programId")]
    program_id: Option<String>,
    category: Option<String>,
    search: Option<String>,
    #[field(name = "minParticipants")]
    min_participants: Option<i32>,
    #[field(name = "maxParticipants")]
    max_participants: Option<i32>,
    #[field(name = "startDate")]
    start_date: Option<String>,
    #[field(name = "endDate")]
    end_date: Option<String>,
    #[field(name = "sortBy")]
    sort_by: Option<String>,
    #[field(name = "sortOrder")]
    sort_order: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

impl ListingFilters {
    /// The canonical key of the ordering cache; page and limit stay out so
    /// every page of one filter combination shares the ordering.
    fn descriptor(&self) -> String {
        fn part(v: &Option<String>) -> &str {
            v.as_deref().unwrap_or("")
        }

        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            part(&self.status),
            part(&self.statuses),
            part(&self.event_type),
            part(&self.program_id),
            part(&self.category),
            part(&self.search).to_lowercase(),
            self.min_participants.map(|v| v.to_string()).unwrap_or_default(),
            self.max_participants.map(|v| v.to_string()).unwrap_or_default(),
            part(&self.start_date),
            part(&self.end_date),
            part(&self.sort_by),
            part(&self.sort_order),
        )
    }

    fn wanted_statuses(&self) -> Option<Vec<EventStatus>> {
        let raw = match (&self.status, &self.statuses) {
            (Some(single), _) => single.clone(),
            (None, Some(list)) => list.clone(),
            (None, None) => return None,
        };

        let parsed: Vec<EventStatus> = raw.split(',').filter_map(|s| EventStatus::from_str(s.trim())).collect();
        if parsed.is_empty() {
            None
        } else {
            Some(parsed)
        }
    }
}

/// Fixed, deterministic sort tie-breakers: `date` falls back to time,
/// `title` to date and time, `organizer` and `type` to title, date and time.
/// Text comparisons are case-insensitive.
fn compare_events(a: &Event, b: &Event, sort_by: &str) -> Ordering {
    fn organizer_name(event: &Event) -> String {
        event.organizers().first().map(|o| o.name.to_lowercase()).unwrap_or_default()
    }

    match sort_by {
        "title" => (a.title.to_lowercase(), &a.date, &a.time).cmp(&(b.title.to_lowercase(), &b.date, &b.time)),
        "organizer" => (organizer_name(a), a.title.to_lowercase(), &a.date, &a.time)
            .cmp(&(organizer_name(b), b.title.to_lowercase(), &b.date, &b.time)),
        "type" => (a.event_type.to_lowercase(), a.title.to_lowercase(), &a.date, &a.time).cmp(&(
            b.event_type.to_lowercase(),
            b.title.to_lowercase(),
            &b.date,
            &b.time,
        )),
        _ => (&a.date, &a.time).cmp(&(&b.date, &b.time)),
    }
}

async fn compute_ordering(filters: &ListingFilters, conn: &DbConn) -> Result<Value, Error> {
    let now = Utc::now();
    let mut events = Event::get_all(conn).await;

    if let Some(statuses) = filters.wanted_statuses() {
        events.retain(|e| statuses.contains(&e.derived_status(now)));
    }
    if let Some(event_type) = &filters.event_type {
        events.retain(|e| &e.event_type == event_type);
    }
    if let Some(category) = &filters.category {
        events.retain(|e| e.category.as_deref() == Some(category.as_str()));
    }
    if let Some(program_id) = &filters.program_id {
        let linked = EventProgram::find_event_uuids(program_id, conn).await;
        events.retain(|e| linked.contains(&e.uuid));
    }
    if let Some(search) = trim_to_option(filters.search.as_deref()) {
        let needle = search.to_lowercase();
        events.retain(|e| {
            e.title.to_lowercase().contains(&needle)
                || e.purpose.as_deref().is_some_and(|p| p.to_lowercase().contains(&needle))
                || e.location.as_deref().is_some_and(|l| l.to_lowercase().contains(&needle))
        });
    }
    if let Some(min) = filters.min_participants {
        events.retain(|e| e.total_slots >= min);
    }
    if let Some(max) = filters.max_participants {
        events.retain(|e| e.total_slots <= max);
    }
    if let Some(start_date) = &filters.start_date {
        events.retain(|e| &e.end_date >= start_date);
    }
    if let Some(end_date) = &filters.end_date {
        events.retain(|e| &e.date <= end_date);
    }

    let sort_by = filters.sort_by.as_deref().unwrap_or("date");
    events.sort_by(|a, b| compare_events(a, b, sort_by));
    if filters.sort_order.as_deref() == Some("desc") {
        events.reverse();
    }

    let ids: Vec<&str> = events.iter().map(|e| e.uuid.as_str()).collect();
    Ok(json!({ "ids": ids, "total": ids.len() }))
}

#[get("/events?<filters..>")]
async fn get_events(filters: ListingFilters, _headers: Headers, conn: DbConn) -> JsonResult {
    let page = filters.page.unwrap_or(1).max(1);
    let limit = filters.limit.unwrap_or(20).clamp(1, 100);
    let listing_ttl = Duration::from_secs(CONFIG.listing_cache_ttl());
    let tags = vec![TAG_EVENTS.to_string(), TAG_LISTINGS.to_string()];

    let descriptor = filters.descriptor();
    let page_key = format!("events:page:{descriptor}:{page}:{limit}");
    if let Some(cached) = EVENT_CACHE.get(&page_key).await {
        return Ok(Json(cached));
    }

    // Two layers: the ordering cache yields (ids, total) per filter
    // combination, the page cache the hydrated slice.
    let order_key = format!("events:order:{descriptor}");
    let ordering =
        EVENT_CACHE.get_or_set(&order_key, listing_ttl, &tags, || compute_ordering(&filters, &conn)).await?;

    let empty = Vec::new();
    let ids = ordering["ids"].as_array().unwrap_or(&empty);
    let total = ids.len();
    let start = (page - 1) * limit;

    let mut events_json = Vec::new();
    for id in ids.iter().skip(start).take(limit) {
        if let Some(id) = id.as_str() {
            if let Some(event) = Event::find_by_uuid(id, &conn).await {
                events_json.push(event.to_json(&conn).await);
            }
        }
    }

    let result = json!({
        "events": events_json,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
            "totalPages": total.div_ceil(limit),
        },
    });

    EVENT_CACHE.set(&page_key, result.clone(), listing_ttl, &tags).await;
    Ok(Json(result))
}

#[get("/events/<event_id>")]
async fn get_event(event_id: &str, _headers: Headers, conn: DbConn) -> JsonResult {
    let key = format!("events:detail:{event_id}");
    let ttl = Duration::from_secs(CONFIG.event_cache_ttl());
    let tags = vec![TAG_EVENTS.to_string(), event_tag(event_id)];

    let view = EVENT_CACHE
        .get_or_set(&key, ttl, &tags, || async {
            match Event::find_by_uuid(event_id, &conn).await {
                Some(event) => Ok(event.to_json(&conn).await),
                None => Err(Error::new("Event not found", "Event not found").with_kind(Kind::NotFound)),
            }
        })
        .await?;

    Ok(Json(json!({ "event": view })))
}

//
// Create & update
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleData {
    id: Option<String>,
    name: String,
    description: Option<String>,
    max_participants: i32,
    open_to_public: Option<bool>,
    agenda: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventData {
    title: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    category: Option<String>,
    date: Option<String>,
    end_date: Option<String>,
    time: Option<String>,
    end_time: Option<String>,
    time_zone: Option<String>,
    format: Option<String>,
    location: Option<String>,
    zoom_link: Option<String>,
    meeting_id: Option<String>,
    passcode: Option<String>,
    purpose: Option<String>,
    status: Option<String>,
    publish: Option<bool>,
    roles: Option<Vec<RoleData>>,
    organizer_details: Option<Vec<OrganizerDetail>>,
    program_labels: Option<Vec<String>>,

    // Control flags, intent rather than data; they never reach the store.
    suppress_notifications: Option<bool>,
    force_delete_registrations: Option<bool>,
}

/// Applies the patch onto the event with the field normalization rules of
/// the update flow. Returns whether any time field changed.
fn normalize_fields(event: &mut Event, data: &EventData) -> Result<bool, Error> {
    let before = (
        event.date.clone(),
        event.time.clone(),
        event.end_date.clone(),
        event.end_time.clone(),
        event.time_zone.clone(),
    );

    if let Some(title) = trim_to_option(data.title.as_deref()) {
        event.title = title;
    }
    if event.title.is_empty() {
        err_kind!(Validation, "The event needs a title");
    }
    if let Some(event_type) = trim_to_option(data.event_type.as_deref()) {
        event.event_type = event_type;
    }
    if data.category.is_some() {
        event.category = trim_to_option(data.category.as_deref());
    }
    if data.purpose.is_some() {
        event.purpose = trim_to_option(data.purpose.as_deref());
    }

    if let Some(date) = trim_to_option(data.date.as_deref()) {
        event.date = date;
        // endDate defaults to the (new) start date unless patched explicitly
        if data.end_date.is_none() {
            event.end_date = event.date.clone();
        }
    }
    if let Some(end_date) = trim_to_option(data.end_date.as_deref()) {
        event.end_date = end_date;
    }
    if let Some(time) = trim_to_option(data.time.as_deref()) {
        event.time = time;
    }
    if let Some(end_time) = trim_to_option(data.end_time.as_deref()) {
        event.end_time = end_time;
    }
    if data.time_zone.is_some() {
        event.time_zone = trim_to_option(data.time_zone.as_deref());
    }

    if let Some(format) = trim_to_option(data.format.as_deref()) {
        event.format = format;
    }
    let Some(format) = event.format_enum() else {
        err_kind!(Validation, format!("Unknown event format {}", event.format));
    };

    if data.location.is_some() {
        event.location = trim_to_option(data.location.as_deref());
    }
    if data.zoom_link.is_some() {
        event.zoom_link = trim_to_option(data.zoom_link.as_deref());
    }
    if data.meeting_id.is_some() {
        event.meeting_id = trim_to_option(data.meeting_id.as_deref());
    }
    if data.passcode.is_some() {
        event.passcode = trim_to_option(data.passcode.as_deref());
    }

    // Format rules: in-person events carry no virtual fields, online events
    // have the literal "Online" location.
    match format {
        EventFormat::InPerson => {
            event.zoom_link = None;
            event.meeting_id = None;
            event.passcode = None;
        }
        EventFormat::Online => {
            event.location = Some(String::from("Online"));
        }
        EventFormat::Hybrid => {}
    }

    // The effective span must be well-formed in the effective zone.
    let (start, end) = match event.instants() {
        Ok(span) => span,
        Err(e) => err_kind!(Validation, e.to_string()),
    };
    if end < start {
        err_kind!(Validation, "The event cannot end before it starts");
    }

    // Persist the resolved wall-clock: a start inside a DST gap comes back
    // rounded forward to the next representable minute.
    if let Ok((date, time)) = crate::clock::from_instant(start, event.time_zone.as_deref()) {
        event.date = date;
        event.time = time;
    }
    if let Ok((end_date, end_time)) = crate::clock::from_instant(end, event.time_zone.as_deref()) {
        event.end_date = end_date;
        event.end_time = end_time;
    }

    let after = (
        event.date.clone(),
        event.time.clone(),
        event.end_date.clone(),
        event.end_time.clone(),
        event.time_zone.clone(),
    );
    Ok(before != after)
}

/// Validates program links: each label must resolve, Leader actors need
/// access themselves, and every co-organizer needs access to each non-free
/// program.
async fn check_program_links(
    program_uuids: &[String],
    actor: &User,
    organizers: &[OrganizerDetail],
    conn: &DbConn,
) -> EmptyResult {
    for program_uuid in program_uuids {
        let Some(program) = Program::find_by_uuid(program_uuid, conn).await else {
            err_kind!(Validation, format!("Unknown program {program_uuid}"));
        };

        if actor.role() == UserRole::Leader && !program.is_accessible_to(actor, conn).await {
            err_kind!(Forbidden, format!("You have no access to the {} program", program.title));
        }

        if !program.is_free {
            for organizer in organizers {
                let Some(co) = User::find_by_uuid(&organizer.user_id, conn).await else {
                    err_kind!(Validation, format!("Unknown co-organizer {}", organizer.user_id));
                };
                if !program.is_accessible_to(&co, conn).await {
                    err_kind!(
                        Forbidden,
                        format!("Program {} is not accessible to co-organizer {}", program.uuid, co.uuid)
                    );
                }
            }
        }
    }
    Ok(())
}

/// Rebuilds the co-organizer display cache from the referenced users.
async fn resolve_organizers(entries: &[OrganizerDetail], conn: &DbConn) -> Result<Vec<OrganizerDetail>, Error> {
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(user) = User::find_by_uuid(&entry.user_id, conn).await else {
            err_kind!(Validation, format!("Unknown co-organizer {}", entry.user_id));
        };
        if !user.is_active || !user.is_verified {
            err_kind!(Validation, format!("Co-organizer {} must be active and verified", user.uuid));
        }
        resolved.push(OrganizerDetail {
            user_id: user.uuid,
            name: user.name,
            email: user.email,
        });
    }
    Ok(resolved)
}

/// The roles diff of the update flow: deletions are guarded by registrant
/// counts, capacity cannot drop below usage, matched ids keep their role id
/// and inherit the fields the patch omits.
async fn apply_roles_patch(event: &Event, patches: &[RoleData], force_delete: bool, conn: &DbConn) -> EmptyResult {
    let existing = EventRole::find_by_event(&event.uuid, conn).await;

    if force_delete {
        Registration::delete_all_by_event(&event.uuid, conn).await?;
        GuestRegistration::delete_all_by_event(&event.uuid, conn).await?;
    } else {
        for old in &existing {
            let kept = patches.iter().any(|p| p.id.as_deref() == Some(old.uuid.as_str()));
            if !kept && Registration::count_by_event_and_role(&event.uuid, &old.uuid, conn).await > 0 {
                err_kind!(RoleHasRegistrants, format!("The {} role still has registrants", old.name));
            }
        }
        for patch in patches {
            if let Some(old) = patch.id.as_ref().and_then(|id| existing.iter().find(|r| &r.uuid == id)) {
                let current = Registration::count_by_event_and_role(&event.uuid, &old.uuid, conn).await;
                if i64::from(patch.max_participants) < current {
                    err_kind!(
                        CapacityBelowUsage,
                        format!("The {} role has {current} registrants, its capacity cannot drop below that", old.name)
                    );
                }
            }
        }
    }

    for (idx, patch) in patches.iter().enumerate() {
        let Some(name) = trim_to_option(Some(patch.name.as_str())) else {
            err_kind!(Validation, "Roles need a name");
        };
        if patch.max_participants < 1 {
            err_kind!(Validation, format!("The {name} role needs a capacity of at least 1"));
        }

        match patch.id.as_ref().and_then(|id| existing.iter().find(|r| &r.uuid == id)) {
            Some(old) => {
                let mut role = old.clone();
                role.name = name;
                if let Some(description) = &patch.description {
                    role.description = description.trim().to_string();
                }
                role.max_participants = patch.max_participants;
                role.open_to_public = patch.open_to_public.unwrap_or(old.open_to_public);
                role.agenda = patch.agenda.clone().or_else(|| old.agenda.clone());
                role.start_time = patch.start_time.clone().or_else(|| old.start_time.clone());
                role.end_time = patch.end_time.clone().or_else(|| old.end_time.clone());
                role.sort_order = idx as i32;
                role.save(conn).await?;
            }
            None => {
                let mut role = EventRole::new(
                    event.uuid.clone(),
                    name,
                    patch.description.clone().unwrap_or_default().trim().to_string(),
                    patch.max_participants,
                    idx as i32,
                );
                role.open_to_public = patch.open_to_public.unwrap_or(true);
                role.agenda = patch.agenda.clone();
                role.start_time = patch.start_time.clone();
                role.end_time = patch.end_time.clone();
                role.save(conn).await?;
            }
        }
    }

    for old in existing {
        if !patches.iter().any(|p| p.id.as_deref() == Some(old.uuid.as_str())) {
            Registration::delete_all_by_event_and_role(&event.uuid, &old.uuid, conn).await?;
            GuestRegistration::delete_all_by_event_and_role(&event.uuid, &old.uuid, conn).await?;
            old.delete(conn).await?;
        }
    }

    Ok(())
}

/// The auto-unpublish guard: a publish request (or published state) with
/// missing format-mandated fields flips publish off and records why.
fn apply_publish_guard(event: &mut Event, requested: Option<bool>) -> (bool, Vec<String>) {
    if let Some(publish) = requested {
        event.publish = publish;
    }

    if !event.publish {
        return (false, Vec::new());
    }

    let missing = event.missing_required_fields();
    if missing.is_empty() {
        event.auto_unpublished_reason = None;
        event.auto_unpublished_at = None;
        (false, Vec::new())
    } else {
        event.publish = false;
        event.auto_unpublished_reason = Some(String::from("MISSING_REQUIRED_FIELDS"));
        event.auto_unpublished_at = Some(Utc::now().naive_utc());
        (true, missing.iter().map(ToString::to_string).collect())
    }
}

fn conflict_summaries(conflicts: &[Event]) -> Vec<Value> {
    conflicts
        .iter()
        .map(|ev| {
            json!({
                "id": ev.uuid,
                "title": ev.title,
                "date": ev.date,
                "endDate": ev.end_date,
                "time": ev.time,
                "endTime": ev.end_time,
                "timeZone": ev.time_zone,
            })
        })
        .collect()
}

#[post("/events", data = "<data>")]
async fn create_event(data: Json<EventData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data: EventData = data.into_inner();
    let actor = headers.user;

    if actor.atype < UserRole::Leader {
        err_kind!(Forbidden, "Only leaders and administrators can create events");
    }

    let (Some(title), Some(event_type), Some(date), Some(time)) =
        (data.title.clone(), data.event_type.clone(), data.date.clone(), data.time.clone())
    else {
        err_kind!(Validation, "An event needs a title, type, date and time");
    };

    let mut event = Event::new(title, event_type, date, time, actor.uuid.clone());
    normalize_fields(&mut event, &data)?;

    let conflicts = Event::find_overlapping(
        &event.date,
        &event.time,
        Some(&event.end_date),
        Some(&event.end_time),
        event.time_zone.as_deref(),
        None,
        &conn,
    )
    .await?;
    if !conflicts.is_empty() {
        err_json!(
            json!({
                "message": "The proposed time overlaps other events",
                "conflicts": conflict_summaries(&conflicts),
            }),
            "Time conflict on event creation",
            Conflict
        );
    }

    let organizers = match &data.organizer_details {
        Some(entries) => resolve_organizers(entries, &conn).await?,
        None => Vec::new(),
    };
    event.set_organizers(&organizers);

    let program_uuids = data.program_labels.clone().unwrap_or_default();
    check_program_links(&program_uuids, &actor, &organizers, &conn).await?;

    let (auto_unpublished, _missing) = apply_publish_guard(&mut event, data.publish);

    // The event row must exist before its roles reference it; the second
    // save picks up the derived counters once the roles are in.
    event.save(&conn).await?;
    if let Some(roles) = &data.roles {
        apply_roles_patch(&event, roles, false, &conn).await?;
    }
    event.save(&conn).await?;

    if let Err(e) = EventProgram::sync_for_event(&event.uuid, &program_uuids, &conn).await {
        warn!("Program links for new event {} were only partially written: {e:#?}", event.uuid);
    }

    let mut audit = AuditEvent::new(AuditEventType::EventCreated, Some(event.uuid.clone()));
    audit.act_user_uuid = Some(actor.uuid.clone());
    if let Err(e) = audit.save(&conn).await {
        error!("Error saving audit event: {e:#?}");
    }

    EVENT_CACHE.invalidate_by_tags(&[TAG_LISTINGS, TAG_ANALYTICS]);

    let view = event.to_json(&conn).await;
    let mut body = json!({ "event": view });
    if auto_unpublished {
        body["autoUnpublished"] = json!(true);
    }
    Ok(Json(body))
}

#[post("/events/<event_id>/update", data = "<data>")]
async fn update_event(event_id: &str, data: Json<EventData>, headers: Headers, conn: DbConn) -> JsonResult {
    let data: EventData = data.into_inner();
    let actor = headers.user;

    // 1. Authorize: edit-any, or organizer of this event.
    let Some(mut event) = Event::find_by_uuid(event_id, &conn).await else {
        err_kind!(NotFound, "Event not found");
    };
    if !actor.can_edit_any_event() && !event.is_organizer(&actor.uuid) {
        err_kind!(Forbidden, "You cannot edit this event");
    }
    if event.stored_status() == EventStatus::Cancelled {
        err_kind!(InvalidState, "Cancelled events cannot be edited");
    }

    // Status is derived, never written by clients; the one legal transition
    // through this endpoint is cancellation, terminal and only before the
    // event completes.
    if let Some(status) = &data.status {
        match EventStatus::from_str(status) {
            Some(EventStatus::Cancelled) => {
                if event.derived_status(Utc::now()) == EventStatus::Completed {
                    err_kind!(InvalidState, "Completed events cannot be cancelled");
                }
                event.status = EventStatus::Cancelled as i32;
            }
            _ => err_kind!(Validation, "Event status cannot be set directly, only cancellation is allowed"),
        }
    }

    // 2. Normalize fields and enforce the format rules.
    let time_changed = normalize_fields(&mut event, &data)?;

    // 3. Conflict check, only when the schedule moved.
    if time_changed {
        let conflicts = Event::find_overlapping(
            &event.date,
            &event.time,
            Some(&event.end_date),
            Some(&event.end_time),
            event.time_zone.as_deref(),
            Some(&event.uuid),
            &conn,
        )
        .await?;
        if !conflicts.is_empty() {
            err_json!(
                json!({
                    "message": "The proposed time overlaps other events",
                    "conflicts": conflict_summaries(&conflicts),
                }),
                "Time conflict on event update",
                Conflict
            );
        }
    }

    // 4. Roles diff.
    if let Some(roles) = &data.roles {
        apply_roles_patch(&event, roles, data.force_delete_registrations.unwrap_or(false), &conn).await?;
    }

    // 5. Organizer details; remember who is new for the notification step.
    let old_organizer_uuids = event.organizer_uuids();
    let mut new_co_organizer_uuids = Vec::new();
    let organizers = match &data.organizer_details {
        Some(entries) => {
            let resolved = resolve_organizers(entries, &conn).await?;
            new_co_organizer_uuids =
                resolved.iter().map(|o| o.user_id.clone()).filter(|u| !old_organizer_uuids.contains(u)).collect();
            event.set_organizers(&resolved);
            resolved
        }
        None => event.organizers(),
    };

    // 6. + 7. Program linkage and access, for the actor and every co-organizer.
    let program_uuids = match &data.program_labels {
        Some(labels) => labels.clone(),
        None => EventProgram::find_program_uuids(&event.uuid, &conn).await,
    };
    check_program_links(&program_uuids, &actor, &organizers, &conn).await?;

    // 8. Auto-unpublish check.
    let (auto_unpublished, missing_fields) = apply_publish_guard(&mut event, data.publish);

    // 9. Persist, then synchronize the inverse program links. The link sync
    // is non-transactional; a partial failure is reconciled later.
    event.save(&conn).await?;
    if let Err(e) = EventProgram::sync_for_event(&event.uuid, &program_uuids, &conn).await {
        warn!("Program links for event {} were only partially written: {e:#?}", event.uuid);
    }

    // 10. Notify, unless suppressed.
    if !data.suppress_notifications.unwrap_or(false) {
        dispatch(SideEffect::EventUpdated {
            event_uuid: event.uuid.clone(),
            actor_uuid: actor.uuid.clone(),
            new_co_organizer_uuids,
            auto_unpublished,
            missing_fields,
        });
    }

    // 11. Caches, then the realtime frame.
    EVENT_CACHE.invalidate_by_tags(&[&event_tag(&event.uuid), TAG_ANALYTICS]);

    let view = event.to_json(&conn).await;
    WS_EVENTS.send_event_update(UpdateType::EventUpdated, &event.uuid, None, None, view.clone());

    let mut body = json!({ "event": view });
    if auto_unpublished {
        body["autoUnpublished"] = json!(true);
    }
    Ok(Json(body))
}

#[delete("/events/<event_id>")]
async fn delete_event(event_id: &str, headers: Headers, conn: DbConn) -> EmptyResult {
    let actor = headers.user;

    let Some(event) = Event::find_by_uuid(event_id, &conn).await else {
        err_kind!(NotFound, "Event not found");
    };
    if !actor.can_edit_any_event() && !event.is_organizer(&actor.uuid) {
        err_kind!(Forbidden, "You cannot delete this event");
    }
    if Registration::count_by_event(&event.uuid, &conn).await > 0 {
        err_kind!(InvalidState, "This event still has registrations");
    }

    let event_uuid = event.uuid.clone();
    event.delete(&conn).await?;

    let mut audit = AuditEvent::new(AuditEventType::EventDeleted, Some(event_uuid.clone()));
    audit.act_user_uuid = Some(actor.uuid.clone());
    if let Err(e) = audit.save(&conn).await {
        error!("Error saving audit event: {e:#?}");
    }

    EVENT_CACHE.invalidate_by_tags(&[&event_tag(&event_uuid), TAG_LISTINGS, TAG_ANALYTICS]);
    Ok(())
}

//
// Conflict probe & derived counts
//

#[derive(FromForm)]
struct ConflictQuery {
    #[field(name = "startDate")]
    start_date: String,
    #[field(name = "startTime")]
    start_time: String,
    #[field(name = "endDate")]
    end_date: Option<String>,
    #[field(name = "endTime")]
    end_time: Option<String>,
    #[field(name = "excludeId")]
    exclude_id: Option<String>,
    mode: Option<String>,
    #[field(name = "timeZone")]
    time_zone: Option<String>,
}

#[get("/events/time-conflict?<query..>")]
async fn time_conflict(query: ConflictQuery, _headers: Headers, conn: DbConn) -> JsonResult {
    let point_mode = query.mode.as_deref() == Some("point");
    let (end_date, end_time) = if point_mode {
        (None, None)
    } else {
        (query.end_date.as_deref(), query.end_time.as_deref())
    };

    let conflicts = Event::find_overlapping(
        &query.start_date,
        &query.start_time,
        end_date,
        end_time,
        query.time_zone.as_deref(),
        query.exclude_id.as_deref(),
        &conn,
    )
    .await?;

    // Echo the start wall-clock after zone resolution; a spring-forward gap
    // rounds it to the next representable minute.
    let start_instant = crate::clock::to_instant(&query.start_date, &query.start_time, query.time_zone.as_deref())?;
    let (normalized_date, normalized_time) = crate::clock::from_instant(start_instant, query.time_zone.as_deref())?;

    Ok(Json(json!({
        "conflict": !conflicts.is_empty(),
        "conflicts": conflict_summaries(&conflicts),
        "normalizedStart": { "date": normalized_date, "time": normalized_time },
    })))
}

#[get("/events/<event_id>/has-registrations")]
async fn has_registrations(event_id: &str, _headers: Headers, conn: DbConn) -> JsonResult {
    if Event::find_by_uuid(event_id, &conn).await.is_none() {
        err_kind!(NotFound, "Event not found");
    }

    let key = format!("events:regcounts:{event_id}");
    let ttl = Duration::from_secs(CONFIG.availability_cache_ttl());
    let tags = vec![TAG_ANALYTICS.to_string(), event_tag(event_id)];

    let counts = EVENT_CACHE
        .get_or_set(&key, ttl, &tags, || async {
            let user_count = Registration::count_distinct_users_by_event(event_id, &conn).await;
            let guest_count = GuestRegistration::count_by_event(event_id, &conn).await;
            Ok(json!({
                "hasRegistrations": user_count + guest_count > 0,
                "userCount": user_count,
                "guestCount": guest_count,
                "totalCount": user_count + guest_count,
            }))
        })
        .await?;

    Ok(Json(counts))
}

#[get("/events/<event_id>/availability")]
async fn availability(event_id: &str, _headers: Headers, conn: DbConn) -> JsonResult {
    if Event::find_by_uuid(event_id, &conn).await.is_none() {
        err_kind!(NotFound, "Event not found");
    }

    let key = format!("events:availability:{event_id}");
    let ttl = Duration::from_secs(CONFIG.availability_cache_ttl());
    let tags = vec![event_tag(event_id)];

    let roles = EVENT_CACHE
        .get_or_set(&key, ttl, &tags, || async {
            let mut entries = Vec::new();
            for role in EventRole::find_by_event(event_id, &conn).await {
                let signed_up = Registration::count_by_event_and_role(event_id, &role.uuid, &conn).await;
                entries.push(json!({
                    "roleId": role.uuid,
                    "name": role.name,
                    "openToPublic": role.open_to_public,
                    "maxParticipants": role.max_participants,
                    "signedUp": signed_up,
                    "full": signed_up >= i64::from(role.max_participants),
                }));
            }
            Ok(json!({ "roles": entries }))
        })
        .await?;

    Ok(Json(roles))
}

//
// Periodic sweeps
//

/// Moves events along `upcoming -> ongoing -> completed` as their spans pass.
/// Cancelled events are never touched. Idempotent and safe next to live
/// traffic, the status write is targeted.
pub async fn status_sweep_job(pool: DbPool) {
    debug!("Running event status sweep");
    let Ok(conn) = pool.get().await else {
        error!("Failed to get DB connection while running the status sweep");
        return;
    };

    let now = Utc::now();
    for event in Event::find_non_cancelled(&conn).await {
        let derived = event.derived_status(now);
        if derived != event.stored_status() {
            info!("Event {} moved to {}", event.uuid, derived.as_str());
            if let Err(e) = Event::update_status(&event.uuid, derived, &conn).await {
                error!("Error persisting swept status for {}: {e:#?}", event.uuid);
                continue;
            }
            EVENT_CACHE.invalidate_by_tags(&[&event_tag(&event.uuid), TAG_LISTINGS]);
        }
    }

    SIGNUP_LOCKS.shrink();
    WS_EVENTS.shrink();
}

/// Safety net for any missed post-commit refresh: realigns the persisted
/// `signed_up` counter with the registration records.
pub async fn counter_sweep_job(pool: DbPool) {
    debug!("Running signup counter sweep");
    let Ok(conn) = pool.get().await else {
        error!("Failed to get DB connection while running the counter sweep");
        return;
    };

    for event in Event::get_all(&conn).await {
        let actual = Registration::count_by_event(&event.uuid, &conn).await as i32;
        if actual != event.signed_up {
            warn!("Correcting drifted signup counter of event {}: {} -> {}", event.uuid, event.signed_up, actual);
            if let Err(e) = Event::update_signed_up(&event.uuid, actual, &conn).await {
                error!("Error correcting signup counter for {}: {e:#?}", event.uuid);
                continue;
            }
            EVENT_CACHE.invalidate_by_tags(&[&event_tag(&event.uuid), TAG_ANALYTICS]);
        }
    }
}

pub async fn audit_cleanup_job(pool: DbPool) {
    debug!("Cleaning up old audit events");
    let Ok(conn) = pool.get().await else {
        error!("Failed to get DB connection while cleaning up audit events");
        return;
    };

    if let Err(e) = AuditEvent::clean_old(&conn).await {
        error!("Error cleaning up audit events: {e:#?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(title: &str, date: &str, time: &str) -> Event {
        Event::new(title.to_string(), "Conference".to_string(), date.to_string(), time.to_string(), "u1".to_string())
    }

    #[test]
    fn date_sort_breaks_ties_on_time() {
        let a = event("B", "2030-05-01", "09:00");
        let b = event("A", "2030-05-01", "08:00");
        assert_eq!(compare_events(&a, &b, "date"), Ordering::Greater);
        assert_eq!(compare_events(&b, &a, "date"), Ordering::Less);
    }

    #[test]
    fn title_sort_is_case_insensitive_with_date_tiebreak() {
        let a = event("alpha", "2030-05-02", "09:00");
        let b = event("Alpha", "2030-05-01", "09:00");
        // Same title after folding, so the earlier date wins.
        assert_eq!(compare_events(&a, &b, "title"), Ordering::Greater);

        let c = event("beta", "2030-01-01", "09:00");
        assert_eq!(compare_events(&a, &c, "title"), Ordering::Less);
    }

    #[test]
    fn type_sort_falls_back_to_title_then_date() {
        let mut a = event("Z", "2030-05-01", "09:00");
        let mut b = event("A", "2030-05-01", "09:00");
        a.event_type = "Meetup".to_string();
        b.event_type = "meetup".to_string();
        assert_eq!(compare_events(&b, &a, "type"), Ordering::Less);
    }

    #[test]
    fn publish_guard_records_missing_fields() {
        let mut ev = event("Launch", "2030-05-01", "09:00");
        ev.format = EventFormat::Online.as_str().to_string();

        let (auto_unpublished, missing) = apply_publish_guard(&mut ev, Some(true));
        assert!(auto_unpublished);
        assert!(!ev.publish);
        assert_eq!(ev.auto_unpublished_reason.as_deref(), Some("MISSING_REQUIRED_FIELDS"));
        assert_eq!(missing, vec!["zoomLink", "meetingId", "passcode"]);

        ev.zoom_link = Some("https://zoom.example/j/1".to_string());
        ev.meeting_id = Some("123".to_string());
        ev.passcode = Some("abc".to_string());
        let (auto_unpublished, missing) = apply_publish_guard(&mut ev, Some(true));
        assert!(!auto_unpublished);
        assert!(ev.publish);
        assert!(missing.is_empty());
        assert!(ev.auto_unpublished_reason.is_none());
    }

    #[test]
    fn publish_guard_leaves_unpublished_events_alone() {
        let mut ev = event("Draft", "2030-05-01", "09:00");
        ev.format = EventFormat::Online.as_str().to_string();

        let (auto_unpublished, missing) = apply_publish_guard(&mut ev, None);
        assert!(!auto_unpublished);
        assert!(missing.is_empty());
        assert!(!ev.publish);
    }
}
