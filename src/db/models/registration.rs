use chrono::{NaiveDateTime, Utc};
use serde_json::Value;

use super::{Event, EventRole, User};
use crate::db::schema::registrations;

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = registrations)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct Registration {
    pub uuid: String,
    pub event_uuid: String,
    pub user_uuid: String,
    pub role_uuid: String,
    pub registration_date: NaiveDateTime,
    pub notes: Option<String>,
    pub special_requirements: Option<String>,
    // The actor that created the record: the user themselves on signup, an
    // organizer on assignment.
    pub registered_by: String,
    // Immutable views captured at registration time, stored serialized.
    // Only the role name/description inside the event snapshot may change,
    // and only on a role move.
    pub user_snapshot: String,
    pub event_snapshot: String,
    // Append-only list of (action, actor, timestamp, comment)
    pub audit_trail: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrailEntry {
    pub action: String,
    pub actor: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Local methods
impl Registration {
    pub fn new(
        event: &Event,
        role: &EventRole,
        user: &User,
        registered_by: &str,
        notes: Option<String>,
        special_requirements: Option<String>,
    ) -> Self {
        let mut registration = Self {
            uuid: crate::util::get_uuid(),
            event_uuid: event.uuid.clone(),
            user_uuid: user.uuid.clone(),
            role_uuid: role.uuid.clone(),
            registration_date: Utc::now().naive_utc(),
            notes,
            special_requirements,
            registered_by: registered_by.to_string(),
            user_snapshot: user.to_snapshot().to_string(),
            event_snapshot: Self::build_event_snapshot(event, role).to_string(),
            audit_trail: String::from("[]"),
        };

        let action = if registered_by == user.uuid {
            "registered"
        } else {
            "assigned"
        };
        registration.append_audit(action, registered_by, None);
        registration
    }

    fn build_event_snapshot(event: &Event, role: &EventRole) -> Value {
        json!({
            "title": event.title,
            "date": event.date,
            "endDate": event.end_date,
            "time": event.time,
            "endTime": event.end_time,
            "timeZone": event.time_zone,
            "roleName": role.name,
            "roleDescription": role.description,
            "location": event.location,
            "format": event.format,
            "zoomLink": event.zoom_link,
            "meetingId": event.meeting_id,
            "passcode": event.passcode,
            "purpose": event.purpose,
        })
    }

    pub fn append_audit(&mut self, action: &str, actor: &str, comment: Option<String>) {
        let mut trail = self.audit_entries();
        trail.push(AuditTrailEntry {
            action: action.to_string(),
            actor: actor.to_string(),
            timestamp: crate::util::format_date(&Utc::now().naive_utc()),
            comment,
        });
        self.audit_trail = serde_json::to_string(&trail).unwrap_or_else(|_| String::from("[]"));
    }

    pub fn audit_entries(&self) -> Vec<AuditTrailEntry> {
        serde_json::from_str(&self.audit_trail).unwrap_or_default()
    }

    /// Rewrites the role reference after a move: the record points at the new
    /// role and the snapshot reflects the new assignment. Everything else in
    /// the snapshot stays as captured at registration time.
    pub fn move_to_role(&mut self, to_role: &EventRole, actor: &str, from_role_name: &str) {
        self.role_uuid = to_role.uuid.clone();

        let mut snapshot: Value = serde_json::from_str(&self.event_snapshot).unwrap_or_else(|_| json!({}));
        snapshot["roleName"] = json!(to_role.name);
        snapshot["roleDescription"] = json!(to_role.description);
        self.event_snapshot = snapshot.to_string();

        self.append_audit("moved", actor, Some(format!("from {} to {}", from_role_name, to_role.name)));
    }

    pub fn user_snapshot_json(&self) -> Value {
        serde_json::from_str(&self.user_snapshot).unwrap_or_else(|_| json!({}))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "eventId": self.event_uuid,
            "userId": self.user_uuid,
            "roleId": self.role_uuid,
            "registrationDate": crate::util::format_date(&self.registration_date),
            "notes": self.notes,
            "specialRequirements": self.special_requirements,
            "registeredBy": self.registered_by,
            "user": self.user_snapshot_json(),
            "eventSnapshot": serde_json::from_str::<Value>(&self.event_snapshot).unwrap_or_else(|_| json!({})),
            "auditTrail": self.audit_entries(),
            "object": "registration",
        })
    }
}

use crate::api::EmptyResult;
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl Registration {
    /// Strict insert. The unique index on `(event_uuid, user_uuid,
    /// role_uuid)` is deliberately left to reject duplicates, so a lost race
    /// against a writer on another process surfaces as a unique violation
    /// the engine reports as `Duplicate`.
    pub async fn insert(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(registrations::table)
                .values(self)
                .execute(conn)
                .map_res("Error inserting registration")
        }}
    }

    /// Single-record update, used by the role move.
    pub async fn update(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(registrations::table.filter(registrations::uuid.eq(&self.uuid)))
                .set(self)
                .execute(conn)
                .map_res("Error updating registration")
        }}
    }

    pub async fn delete(self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(registrations::table.filter(registrations::uuid.eq(self.uuid)))
                .execute(conn)
                .map_res("Error deleting registration")
        }}
    }

    /// Atomic delete keyed on the registration triple. Returns whether a
    /// record actually existed, so cancellation can answer `NotRegistered`
    /// without a separate read.
    pub async fn delete_by_event_user_role(
        event_uuid: &str,
        user_uuid: &str,
        role_uuid: &str,
        conn: &DbConn,
    ) -> Result<bool, crate::error::Error> {
        db_run! { conn: {
            diesel::delete(
                registrations::table
                    .filter(registrations::event_uuid.eq(event_uuid))
                    .filter(registrations::user_uuid.eq(user_uuid))
                    .filter(registrations::role_uuid.eq(role_uuid)),
            )
            .execute(conn)
            .map(|rows| rows > 0)
            .map_res("Error deleting registration")
        }}
    }

    pub async fn delete_all_by_event(event_uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(registrations::table.filter(registrations::event_uuid.eq(event_uuid)))
                .execute(conn)
                .map_res("Error deleting registrations by event")
        }}
    }

    pub async fn delete_all_by_event_and_role(event_uuid: &str, role_uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(
                registrations::table
                    .filter(registrations::event_uuid.eq(event_uuid))
                    .filter(registrations::role_uuid.eq(role_uuid)),
            )
            .execute(conn)
            .map_res("Error deleting registrations by role")
        }}
    }

    pub async fn delete_all_by_user(user_uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(registrations::table.filter(registrations::user_uuid.eq(user_uuid)))
                .execute(conn)
                .map_res("Error deleting registrations by user")
        }}
    }

    pub async fn find_by_uuid(uuid: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            registrations::table
                .filter(registrations::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_event_user_role(
        event_uuid: &str,
        user_uuid: &str,
        role_uuid: &str,
        conn: &DbConn,
    ) -> Option<Self> {
        db_run! { conn: {
            registrations::table
                .filter(registrations::event_uuid.eq(event_uuid))
                .filter(registrations::user_uuid.eq(user_uuid))
                .filter(registrations::role_uuid.eq(role_uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_event(event_uuid: &str, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            registrations::table
                .filter(registrations::event_uuid.eq(event_uuid))
                .order(registrations::registration_date.asc())
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn find_by_event_and_role(event_uuid: &str, role_uuid: &str, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            registrations::table
                .filter(registrations::event_uuid.eq(event_uuid))
                .filter(registrations::role_uuid.eq(role_uuid))
                .order(registrations::registration_date.asc())
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn find_by_user(user_uuid: &str, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            registrations::table
                .filter(registrations::user_uuid.eq(user_uuid))
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn find_by_user_and_event(user_uuid: &str, event_uuid: &str, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            registrations::table
                .filter(registrations::user_uuid.eq(user_uuid))
                .filter(registrations::event_uuid.eq(event_uuid))
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    /// The capacity counter: currently active registrations for one role.
    /// Counts straight off the store; signup paths depend on this never
    /// reading a cache.
    pub async fn count_by_event_and_role(event_uuid: &str, role_uuid: &str, conn: &DbConn) -> i64 {
        db_run! { conn: {
            registrations::table
                .filter(registrations::event_uuid.eq(event_uuid))
                .filter(registrations::role_uuid.eq(role_uuid))
                .count()
                .first::<i64>(conn)
                .unwrap_or(0)
        }}
    }

    pub async fn count_by_event(event_uuid: &str, conn: &DbConn) -> i64 {
        db_run! { conn: {
            registrations::table
                .filter(registrations::event_uuid.eq(event_uuid))
                .count()
                .first::<i64>(conn)
                .unwrap_or(0)
        }}
    }

    /// Distinct users with at least one role in the event.
    pub async fn count_distinct_users_by_event(event_uuid: &str, conn: &DbConn) -> i64 {
        db_run! { conn: {
            registrations::table
                .filter(registrations::event_uuid.eq(event_uuid))
                .select(diesel::dsl::count_distinct(registrations::user_uuid))
                .first::<i64>(conn)
                .unwrap_or(0)
        }}
    }

    /// How many distinct roles the user already holds in the event, checked
    /// against the per-level role quota.
    pub async fn count_by_user_and_event(user_uuid: &str, event_uuid: &str, conn: &DbConn) -> i64 {
        db_run! { conn: {
            registrations::table
                .filter(registrations::user_uuid.eq(user_uuid))
                .filter(registrations::event_uuid.eq(event_uuid))
                .count()
                .first::<i64>(conn)
                .unwrap_or(0)
        }}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event::new(
            "Mentor Circle".to_string(),
            "Webinar".to_string(),
            "2030-05-01".to_string(),
            "18:00".to_string(),
            "organizer-1".to_string(),
        )
    }

    fn sample_role(event: &Event) -> EventRole {
        EventRole::new(event.uuid.clone(), "Speaker".to_string(), "Runs the session".to_string(), 2, 0)
    }

    fn sample_user() -> User {
        let mut user = User::new("ana@example.com".to_string(), "Ana".to_string());
        user.is_verified = true;
        user
    }

    #[test]
    fn self_signup_starts_a_registered_trail() {
        let event = sample_event();
        let role = sample_role(&event);
        let user = sample_user();

        let registration = Registration::new(&event, &role, &user, &user.uuid, None, None);
        let trail = registration.audit_entries();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "registered");
        assert_eq!(trail[0].actor, user.uuid);
    }

    #[test]
    fn assignment_starts_an_assigned_trail() {
        let event = sample_event();
        let role = sample_role(&event);
        let user = sample_user();

        let registration = Registration::new(&event, &role, &user, "organizer-1", None, None);
        assert_eq!(registration.audit_entries()[0].action, "assigned");
        assert_eq!(registration.registered_by, "organizer-1");
    }

    #[test]
    fn move_updates_only_role_fields_of_the_snapshot() {
        let event = sample_event();
        let role = sample_role(&event);
        let user = sample_user();
        let mut registration = Registration::new(&event, &role, &user, &user.uuid, None, None);

        let to_role =
            EventRole::new(event.uuid.clone(), "Host".to_string(), "Welcomes attendees".to_string(), 1, 1);
        registration.move_to_role(&to_role, "organizer-1", &role.name);

        assert_eq!(registration.role_uuid, to_role.uuid);

        let snapshot: Value = serde_json::from_str(&registration.event_snapshot).unwrap();
        assert_eq!(snapshot["roleName"], json!("Host"));
        assert_eq!(snapshot["roleDescription"], json!("Welcomes attendees"));
        assert_eq!(snapshot["title"], json!("Mentor Circle"));

        let trail = registration.audit_entries();
        assert_eq!(trail.last().unwrap().action, "moved");
        assert_eq!(trail.last().unwrap().comment.as_deref(), Some("from Speaker to Host"));
    }
}
