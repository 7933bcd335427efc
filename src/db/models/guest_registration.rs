use chrono::NaiveDateTime;
use serde_json::Value;

use crate::db::schema::guest_registrations;

/// A guest row: someone invited onto a role without an account. Only the
/// read and notification paths touch these; guests never sign up through
/// the engine.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = guest_registrations)]
#[diesel(primary_key(uuid))]
pub struct GuestRegistration {
    pub uuid: String,
    pub event_uuid: String,
    pub role_uuid: String,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Local methods
impl GuestRegistration {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "roleId": self.role_uuid,
            "fullName": self.full_name,
            "email": self.email,
            "phone": self.phone,
            "notes": self.notes,
            "createdAt": crate::util::format_date(&self.created_at),
            "object": "guestRegistration",
        })
    }
}

use crate::api::EmptyResult;
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl GuestRegistration {
    pub async fn find_by_event(event_uuid: &str, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            guest_registrations::table
                .filter(guest_registrations::event_uuid.eq(event_uuid))
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn count_by_event(event_uuid: &str, conn: &DbConn) -> i64 {
        db_run! { conn: {
            guest_registrations::table
                .filter(guest_registrations::event_uuid.eq(event_uuid))
                .count()
                .first::<i64>(conn)
                .unwrap_or(0)
        }}
    }

    pub async fn delete_all_by_event(event_uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(guest_registrations::table.filter(guest_registrations::event_uuid.eq(event_uuid)))
                .execute(conn)
                .map_res("Error deleting guest registrations")
        }}
    }

    pub async fn delete_all_by_event_and_role(event_uuid: &str, role_uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(
                guest_registrations::table
                    .filter(guest_registrations::event_uuid.eq(event_uuid))
                    .filter(guest_registrations::role_uuid.eq(role_uuid)),
            )
            .execute(conn)
            .map_res("Error deleting guest registrations by role")
        }}
    }
}
