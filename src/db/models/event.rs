use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use num_traits::FromPrimitive;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::clock;
use crate::db::schema::{event_roles, events};

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = events)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct Event {
    pub uuid: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub title: String,
    pub event_type: String,
    pub category: Option<String>,

    // Wall-clock span, always paired with the IANA zone to produce instants
    pub date: String,     // YYYY-MM-DD
    pub end_date: String, // YYYY-MM-DD
    pub time: String,     // HH:MM
    pub end_time: String, // HH:MM
    pub time_zone: Option<String>,

    pub format: String, // EventFormat
    pub location: Option<String>,
    pub zoom_link: Option<String>,
    pub meeting_id: Option<String>,
    pub passcode: Option<String>,
    pub purpose: Option<String>,

    pub status: i32, // EventStatus
    pub publish: bool,
    pub auto_unpublished_reason: Option<String>,
    pub auto_unpublished_at: Option<NaiveDateTime>,
    pub workshop_group_topics: Option<String>,

    // Derived counters, recomputed by the save hook
    pub total_slots: i32,
    pub signed_up: i32,

    pub created_by: String,
    pub organizer_details: String,
}

#[derive(Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = event_roles)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct EventRole {
    pub uuid: String,
    pub event_uuid: String,
    pub name: String,
    pub description: String,
    pub max_participants: i32,
    pub open_to_public: bool,
    pub agenda: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub sort_order: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum EventStatus {
    Upcoming = 0,
    Ongoing = 1,
    Completed = 2,
    Cancelled = 3,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Upcoming => "upcoming",
            EventStatus::Ongoing => "ongoing",
            EventStatus::Completed => "completed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "upcoming" => Some(EventStatus::Upcoming),
            "ongoing" => Some(EventStatus::Ongoing),
            "completed" => Some(EventStatus::Completed),
            "cancelled" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }

    /// The pure status function: `now < start` is upcoming, `start <= now <
    /// end` is ongoing, `now >= end` is completed. An end before the start is
    /// treated as equal to the start so broken data cannot yield a span that
    /// completes before it begins.
    pub fn derive(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let end = if end < start {
            start
        } else {
            end
        };

        if now < start {
            EventStatus::Upcoming
        } else if now < end {
            EventStatus::Ongoing
        } else {
            EventStatus::Completed
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventFormat {
    InPerson,
    Online,
    Hybrid,
}

impl EventFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "In-person" => Some(EventFormat::InPerson),
            "Online" => Some(EventFormat::Online),
            "Hybrid Participation" => Some(EventFormat::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventFormat::InPerson => "In-person",
            EventFormat::Online => "Online",
            EventFormat::Hybrid => "Hybrid Participation",
        }
    }

    pub fn requires_location(&self) -> bool {
        !matches!(self, EventFormat::Online)
    }

    pub fn requires_virtual_fields(&self) -> bool {
        !matches!(self, EventFormat::InPerson)
    }
}

/// A co-organizer entry as stored in `organizer_details`, a display cache so
/// event views need no user lookups.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizerDetail {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

pub const WORKSHOP_EVENT_TYPE: &str = "Effective Communication Workshop";
pub const WORKSHOP_GROUPS: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

pub fn workshop_group_leader_role(group: &str) -> String {
    format!("Group {group} Leader")
}

/// Local methods
impl Event {
    #[allow(clippy::too_many_arguments)]
    pub fn new(title: String, event_type: String, date: String, time: String, created_by: String) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: crate::util::get_uuid(),
            created_at: now,
            updated_at: now,
            title,
            event_type,
            category: None,

            end_date: date.clone(),
            date,
            end_time: time.clone(),
            time,
            time_zone: None,

            format: EventFormat::InPerson.as_str().to_string(),
            location: None,
            zoom_link: None,
            meeting_id: None,
            passcode: None,
            purpose: None,

            status: EventStatus::Upcoming as i32,
            publish: false,
            auto_unpublished_reason: None,
            auto_unpublished_at: None,
            workshop_group_topics: None,

            total_slots: 0,
            signed_up: 0,

            created_by,
            organizer_details: String::from("[]"),
        }
    }

    pub fn stored_status(&self) -> EventStatus {
        EventStatus::from_i32(self.status).unwrap_or(EventStatus::Upcoming)
    }

    pub fn format_enum(&self) -> Option<EventFormat> {
        EventFormat::from_str(&self.format)
    }

    /// The `[start, end)` span as instants in the event's zone.
    pub fn instants(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), crate::error::Error> {
        clock::span_to_instants(
            &self.date,
            &self.time,
            Some(&self.end_date),
            Some(&self.end_time),
            self.time_zone.as_deref(),
        )
    }

    /// Status as of `now`. Cancelled is terminal and never overwritten; an
    /// unparseable span keeps whatever status is stored.
    pub fn derived_status(&self, now: DateTime<Utc>) -> EventStatus {
        let stored = self.stored_status();
        if stored == EventStatus::Cancelled {
            return EventStatus::Cancelled;
        }
        match self.instants() {
            Ok((start, end)) => EventStatus::derive(start, end, now),
            Err(_) => stored,
        }
    }

    pub fn is_organizer(&self, user_uuid: &str) -> bool {
        self.created_by == user_uuid || self.organizer_uuids().iter().any(|u| u == user_uuid)
    }

    pub fn organizers(&self) -> Vec<OrganizerDetail> {
        serde_json::from_str(&self.organizer_details).unwrap_or_default()
    }

    pub fn organizer_uuids(&self) -> Vec<String> {
        self.organizers().into_iter().map(|o| o.user_id).collect()
    }

    pub fn set_organizers(&mut self, organizers: &[OrganizerDetail]) {
        self.organizer_details = serde_json::to_string(organizers).unwrap_or_else(|_| String::from("[]"));
    }

    pub fn group_topics(&self) -> BTreeMap<String, String> {
        self.workshop_group_topics.as_deref().and_then(|t| serde_json::from_str(t).ok()).unwrap_or_default()
    }

    pub fn set_group_topic(&mut self, group: &str, topic: &str) {
        let mut topics = self.group_topics();
        topics.insert(group.to_string(), topic.trim().to_string());
        self.workshop_group_topics = serde_json::to_string(&topics).ok();
    }

    /// The format-mandated fields that are currently missing, by their client
    /// facing names. A published event with a non-empty result here gets
    /// auto-unpublished.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let Some(format) = self.format_enum() else {
            missing.push("format");
            return missing;
        };

        fn blank(v: &Option<String>) -> bool {
            v.as_deref().is_none_or(|s| s.trim().is_empty())
        }

        if format.requires_location() && blank(&self.location) {
            missing.push("location");
        }
        if format.requires_virtual_fields() {
            if blank(&self.zoom_link) {
                missing.push("zoomLink");
            }
            if blank(&self.meeting_id) {
                missing.push("meetingId");
            }
            if blank(&self.passcode) {
                missing.push("passcode");
            }
        }
        missing
    }
}

/// Local methods
impl EventRole {
    pub fn new(event_uuid: String, name: String, description: String, max_participants: i32, sort_order: i32) -> Self {
        Self {
            uuid: crate::util::get_uuid(),
            event_uuid,
            name,
            description,
            max_participants,
            open_to_public: true,
            agenda: None,
            start_time: None,
            end_time: None,
            sort_order,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "name": self.name,
            "description": self.description,
            "maxParticipants": self.max_participants,
            "openToPublic": self.open_to_public,
            "agenda": self.agenda,
            "startTime": self.start_time,
            "endTime": self.end_time,
            "object": "eventRole",
        })
    }
}

use super::{EventProgram, Registration};
use crate::api::EmptyResult;
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl Event {
    /// Persist hook: the derived counters are recomputed from the roles and
    /// registrations on every save, so `total_slots` and `signed_up` can only
    /// drift when a write bypasses this method (the counter sweep covers that).
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.total_slots = EventRole::sum_max_participants(&self.uuid, conn).await as i32;
        self.signed_up = Registration::count_by_event(&self.uuid, conn).await as i32;
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(events::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving event")
            }
            postgresql {
                diesel::insert_into(events::table)
                    .values(&*self)
                    .on_conflict(events::uuid)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving event")
            }
        }
    }

    pub async fn delete(self, conn: &DbConn) -> EmptyResult {
        Registration::delete_all_by_event(&self.uuid, conn).await?;
        super::GuestRegistration::delete_all_by_event(&self.uuid, conn).await?;
        EventProgram::delete_all_by_event(&self.uuid, conn).await?;
        EventRole::delete_all_by_event(&self.uuid, conn).await?;

        db_run! { conn: {
            diesel::delete(events::table.filter(events::uuid.eq(self.uuid)))
                .execute(conn)
                .map_res("Error deleting event")
        }}
    }

    pub async fn find_by_uuid(uuid: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            events::table
                .filter(events::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn get_all(conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            events::table.load::<Self>(conn).expect("Error loading events")
        }}
    }

    pub async fn find_non_cancelled(conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            events::table
                .filter(events::status.ne(EventStatus::Cancelled as i32))
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    /// Date-range narrowing for the conflict detector. The wall-clock dates
    /// are compared lexicographically (ISO dates order correctly) and the
    /// window is already widened by the caller to absorb zone offsets.
    pub async fn find_non_cancelled_in_date_span(min_date: &str, max_date: &str, conn: &DbConn) -> Vec<Self> {
        let (min_date, max_date) = (min_date.to_string(), max_date.to_string());
        db_run! { conn: {
            events::table
                .filter(events::status.ne(EventStatus::Cancelled as i32))
                .filter(events::date.le(max_date))
                .filter(events::end_date.ge(min_date))
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    /// Targeted status write used by the status sweep; does not touch the
    /// counters or `updated_at`.
    pub async fn update_status(uuid: &str, status: EventStatus, conn: &DbConn) -> EmptyResult {
        let uuid = uuid.to_string();
        db_run! { conn: {
            diesel::update(events::table.filter(events::uuid.eq(uuid)))
                .set(events::status.eq(status as i32))
                .execute(conn)
                .map_res("Error updating event status")
        }}
    }

    /// Targeted counter write used by the counter sweep.
    pub async fn update_signed_up(uuid: &str, signed_up: i32, conn: &DbConn) -> EmptyResult {
        let uuid = uuid.to_string();
        db_run! { conn: {
            diesel::update(events::table.filter(events::uuid.eq(uuid)))
                .set(events::signed_up.eq(signed_up))
                .execute(conn)
                .map_res("Error updating event signup counter")
        }}
    }

    /// The non-cancelled events whose `[start, end)` span overlaps the given
    /// one. Touching boundaries do not conflict. When no explicit end is
    /// given the span is nudged to one minute so point queries work.
    pub async fn find_overlapping(
        start_date: &str,
        start_time: &str,
        end_date: Option<&str>,
        end_time: Option<&str>,
        tz: Option<&str>,
        exclude_uuid: Option<&str>,
        conn: &DbConn,
    ) -> Result<Vec<Self>, crate::error::Error> {
        let new_start = clock::to_instant(start_date, start_time, tz)?;
        let mut new_end = match (end_date, end_time) {
            // Point-in-interval query: nudge the end by one minute.
            (None, None) => new_start + TimeDelta::try_minutes(1).unwrap(),
            _ => clock::to_instant(end_date.unwrap_or(start_date), end_time.unwrap_or(start_time), tz)?,
        };
        if new_end < new_start {
            new_end = new_start;
        }

        // Widen the window by a day on both sides; zone offsets can move an
        // instant across a calendar date boundary.
        let min_date = (clock::parse_date(start_date)? - TimeDelta::try_days(1).unwrap()).format(clock::DATE_FMT).to_string();
        let max_date = (clock::parse_date(end_date.unwrap_or(start_date))? + TimeDelta::try_days(1).unwrap())
            .format(clock::DATE_FMT)
            .to_string();

        let candidates = Self::find_non_cancelled_in_date_span(&min_date, &max_date, conn).await;

        let mut conflicts: Vec<Self> = candidates
            .into_iter()
            .filter(|ev| exclude_uuid != Some(ev.uuid.as_str()))
            .filter(|ev| match ev.instants() {
                Ok((ev_start, ev_end)) => {
                    let ev_end = if ev_end < ev_start {
                        ev_start
                    } else {
                        ev_end
                    };
                    new_start < ev_end && new_end > ev_start
                }
                Err(e) => {
                    warn!("Skipping event {} in conflict check, invalid span: {e}", ev.uuid);
                    false
                }
            })
            .collect();

        conflicts.sort_by(|a, b| (&a.date, &a.time).cmp(&(&b.date, &b.time)));
        Ok(conflicts)
    }

    /// The full event view returned to clients and broadcast on the realtime
    /// bus: roles carry their current registrations, the top level carries
    /// the derived counters.
    pub async fn to_json(&self, conn: &DbConn) -> Value {
        let roles = EventRole::find_by_event(&self.uuid, conn).await;
        let registrations = Registration::find_by_event(&self.uuid, conn).await;
        let guests = super::GuestRegistration::find_by_event(&self.uuid, conn).await;
        let program_uuids = EventProgram::find_program_uuids(&self.uuid, conn).await;

        let roles_json: Vec<Value> = roles
            .iter()
            .map(|role| {
                let regs: Vec<Value> =
                    registrations.iter().filter(|r| r.role_uuid == role.uuid).map(Registration::to_json).collect();
                let role_guests: Vec<Value> = guests
                    .iter()
                    .filter(|g| g.role_uuid == role.uuid)
                    .map(super::GuestRegistration::to_json)
                    .collect();
                let mut role_json = role.to_json();
                role_json["signedUp"] = json!(regs.len());
                role_json["full"] = json!(regs.len() as i32 >= role.max_participants);
                role_json["registrations"] = json!(regs);
                role_json["guests"] = json!(role_guests);
                role_json
            })
            .collect();

        let topics = self.group_topics();

        json!({
            "id": self.uuid,
            "title": self.title,
            "type": self.event_type,
            "category": self.category,
            "date": self.date,
            "endDate": self.end_date,
            "time": self.time,
            "endTime": self.end_time,
            "timeZone": self.time_zone,
            "format": self.format,
            "location": self.location,
            "zoomLink": self.zoom_link,
            "meetingId": self.meeting_id,
            "passcode": self.passcode,
            "purpose": self.purpose,
            "status": self.derived_status(Utc::now()).as_str(),
            "publish": self.publish,
            "autoUnpublishedReason": self.auto_unpublished_reason,
            "autoUnpublishedAt": self.auto_unpublished_at.as_ref().map(crate::util::format_date),
            "workshopGroupTopics": if topics.is_empty() { Value::Null } else { json!(topics) },
            "roles": roles_json,
            "totalSlots": self.total_slots,
            "signedUp": self.signed_up,
            "createdBy": self.created_by,
            "organizerDetails": self.organizers(),
            "programLabels": program_uuids,
            "createdAt": crate::util::format_date(&self.created_at),
            "updatedAt": crate::util::format_date(&self.updated_at),
            "object": "event",
        })
    }
}

/// Database methods
impl EventRole {
    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(event_roles::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving event role")
            }
            postgresql {
                diesel::insert_into(event_roles::table)
                    .values(self)
                    .on_conflict(event_roles::uuid)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving event role")
            }
        }
    }

    pub async fn delete(self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(event_roles::table.filter(event_roles::uuid.eq(self.uuid)))
                .execute(conn)
                .map_res("Error deleting event role")
        }}
    }

    pub async fn delete_all_by_event(event_uuid: &str, conn: &DbConn) -> EmptyResult {
        let event_uuid = event_uuid.to_string();
        db_run! { conn: {
            diesel::delete(event_roles::table.filter(event_roles::event_uuid.eq(event_uuid)))
                .execute(conn)
                .map_res("Error deleting event roles")
        }}
    }

    pub async fn find_by_uuid_and_event(uuid: &str, event_uuid: &str, conn: &DbConn) -> Option<Self> {
        let (uuid, event_uuid) = (uuid.to_string(), event_uuid.to_string());
        db_run! { conn: {
            event_roles::table
                .filter(event_roles::uuid.eq(uuid))
                .filter(event_roles::event_uuid.eq(event_uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_event(event_uuid: &str, conn: &DbConn) -> Vec<Self> {
        let event_uuid = event_uuid.to_string();
        db_run! { conn: {
            event_roles::table
                .filter(event_roles::event_uuid.eq(event_uuid))
                .order((event_roles::sort_order.asc(), event_roles::name.asc()))
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn sum_max_participants(event_uuid: &str, conn: &DbConn) -> i64 {
        let event_uuid = event_uuid.to_string();
        db_run! { conn: {
            event_roles::table
                .filter(event_roles::event_uuid.eq(event_uuid))
                .select(diesel::dsl::sum(event_roles::max_participants))
                .first::<Option<i64>>(conn)
                .ok()
                .flatten()
                .unwrap_or(0)
        }}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn status_derivation_is_monotone() {
        let start = instant("2025-06-15T10:00:00Z");
        let end = instant("2025-06-15T12:00:00Z");

        assert_eq!(EventStatus::derive(start, end, instant("2025-06-15T09:59:59Z")), EventStatus::Upcoming);
        assert_eq!(EventStatus::derive(start, end, start), EventStatus::Ongoing);
        assert_eq!(EventStatus::derive(start, end, instant("2025-06-15T11:59:59Z")), EventStatus::Ongoing);
        assert_eq!(EventStatus::derive(start, end, end), EventStatus::Completed);
    }

    #[test]
    fn status_derivation_clamps_inverted_spans() {
        let start = instant("2025-06-15T10:00:00Z");
        let end = instant("2025-06-15T08:00:00Z");

        // end < start is treated as end == start, so the event is not
        // completed before it begins.
        assert_eq!(EventStatus::derive(start, end, instant("2025-06-15T09:00:00Z")), EventStatus::Upcoming);
        assert_eq!(EventStatus::derive(start, end, instant("2025-06-15T10:00:00Z")), EventStatus::Completed);
    }

    #[test]
    fn cancelled_status_is_sticky() {
        let mut event = Event::new(
            "Spring Gathering".to_string(),
            "Conference".to_string(),
            "2020-01-01".to_string(),
            "10:00".to_string(),
            "creator".to_string(),
        );
        event.status = EventStatus::Cancelled as i32;

        // Even though the span is long past, a cancelled event stays cancelled.
        assert_eq!(event.derived_status(Utc::now()), EventStatus::Cancelled);
    }

    #[test]
    fn missing_required_fields_follow_format_rules() {
        let mut event = Event::new(
            "Mentor Circle".to_string(),
            "Webinar".to_string(),
            "2030-05-01".to_string(),
            "18:00".to_string(),
            "creator".to_string(),
        );

        event.format = EventFormat::InPerson.as_str().to_string();
        assert_eq!(event.missing_required_fields(), vec!["location"]);

        event.location = Some("Main Hall".to_string());
        assert!(event.missing_required_fields().is_empty());

        event.format = EventFormat::Online.as_str().to_string();
        assert_eq!(event.missing_required_fields(), vec!["zoomLink", "meetingId", "passcode"]);

        event.format = EventFormat::Hybrid.as_str().to_string();
        event.zoom_link = Some("https://zoom.example/j/1".to_string());
        event.meeting_id = Some("123".to_string());
        event.passcode = Some("abc".to_string());
        assert!(event.missing_required_fields().is_empty());

        event.format = "Teleportation".to_string();
        assert_eq!(event.missing_required_fields(), vec!["format"]);
    }

    #[test]
    fn organizer_details_round_trip() {
        let mut event = Event::new(
            "Board Sync".to_string(),
            "Meeting".to_string(),
            "2030-05-01".to_string(),
            "18:00".to_string(),
            "creator".to_string(),
        );
        assert!(event.is_organizer("creator"));
        assert!(!event.is_organizer("helper"));

        event.set_organizers(&[OrganizerDetail {
            user_id: "helper".to_string(),
            name: "Helper".to_string(),
            email: "helper@example.com".to_string(),
        }]);
        assert!(event.is_organizer("helper"));
        assert_eq!(event.organizer_uuids(), vec!["helper".to_string()]);
    }

    #[test]
    fn group_topics_are_trimmed_and_keyed() {
        let mut event = Event::new(
            "Communication Workshop".to_string(),
            WORKSHOP_EVENT_TYPE.to_string(),
            "2030-05-01".to_string(),
            "18:00".to_string(),
            "creator".to_string(),
        );
        event.set_group_topic("B", "  Listening exercises  ");
        assert_eq!(event.group_topics().get("B").map(String::as_str), Some("Listening exercises"));

        assert_eq!(workshop_group_leader_role("B"), "Group B Leader");
    }
}
