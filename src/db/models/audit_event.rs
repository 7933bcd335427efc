use chrono::{NaiveDateTime, TimeDelta, Utc};

use crate::db::schema::audit_events;
use crate::CONFIG;

/// One audit row per engine action, the third element of a notification
/// trio. Retention is bounded by the daily cleanup job.
#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = audit_events)]
#[diesel(primary_key(uuid))]
pub struct AuditEvent {
    pub uuid: String,
    pub atype: i32, // AuditEventType
    pub event_uuid: Option<String>,
    pub registration_uuid: Option<String>,
    // The user the action was about
    pub user_uuid: Option<String>,
    // The user that performed the action
    pub act_user_uuid: Option<String>,
    pub event_date: NaiveDateTime,
}

#[derive(Debug, Copy, Clone)]
pub enum AuditEventType {
    // Registration
    UserSignedUp = 1000,
    UserCancelled = 1001,
    UserRemoved = 1002,
    UserMoved = 1003,
    UserAssigned = 1004,
    UserDeclined = 1005,

    // Event
    EventCreated = 1100,
    EventUpdated = 1101,
    EventDeleted = 1102,
    EventAutoUnpublished = 1103,
    WorkshopTopicUpdated = 1104,
}

/// Local methods
impl AuditEvent {
    pub fn new(atype: AuditEventType, event_uuid: Option<String>) -> Self {
        Self {
            uuid: crate::util::get_uuid(),
            atype: atype as i32,
            event_uuid,
            registration_uuid: None,
            user_uuid: None,
            act_user_uuid: None,
            event_date: Utc::now().naive_utc(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.uuid,
            "type": self.atype,
            "eventId": self.event_uuid,
            "registrationId": self.registration_uuid,
            "userId": self.user_uuid,
            "actingUserId": self.act_user_uuid,
            "date": crate::util::format_date(&self.event_date),
            "object": "auditEvent",
        })
    }
}

use crate::api::EmptyResult;
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl AuditEvent {
    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(audit_events::table)
                .values(self)
                .execute(conn)
                .map_res("Error saving audit event")
        }}
    }

    pub async fn find_by_event(event_uuid: &str, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            audit_events::table
                .filter(audit_events::event_uuid.eq(event_uuid))
                .order(audit_events::event_date.desc())
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn clean_old(conn: &DbConn) -> EmptyResult {
        let days_retain = CONFIG.audit_days_retain();
        if days_retain <= 0 {
            return Ok(());
        }

        let Some(delta) = TimeDelta::try_days(days_retain) else {
            err!("Invalid audit retention window")
        };
        let dt = Utc::now().naive_utc() - delta;
        db_run! { conn: {
            diesel::delete(audit_events::table.filter(audit_events::event_date.lt(dt)))
                .execute(conn)
                .map_res("Error deleting old audit events")
        }}
    }
}
