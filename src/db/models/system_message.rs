use chrono::{NaiveDateTime, Utc};
use serde_json::Value;

use crate::db::schema::system_messages;

/// The in-product half of a notification trio: a message in the recipient's
/// inbox, written by the side-effect dispatcher.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = system_messages)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct SystemMessage {
    pub uuid: String,
    pub user_uuid: String,
    pub title: String,
    pub body: String,
    pub kind: String,
    pub created_at: NaiveDateTime,
    pub read_at: Option<NaiveDateTime>,
}

/// Local methods
impl SystemMessage {
    pub fn new(user_uuid: String, title: String, body: String, kind: String) -> Self {
        Self {
            uuid: crate::util::get_uuid(),
            user_uuid,
            title,
            body,
            kind,
            created_at: Utc::now().naive_utc(),
            read_at: None,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "title": self.title,
            "body": self.body,
            "kind": self.kind,
            "createdAt": crate::util::format_date(&self.created_at),
            "readAt": self.read_at.as_ref().map(crate::util::format_date),
            "object": "systemMessage",
        })
    }
}

use crate::api::EmptyResult;
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl SystemMessage {
    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(system_messages::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving system message")
            }
            postgresql {
                diesel::insert_into(system_messages::table)
                    .values(self)
                    .on_conflict(system_messages::uuid)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving system message")
            }
        }
    }

    pub async fn mark_read(&mut self, conn: &DbConn) -> EmptyResult {
        self.read_at = Some(Utc::now().naive_utc());
        self.save(conn).await
    }

    pub async fn find_by_uuid_and_user(uuid: &str, user_uuid: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            system_messages::table
                .filter(system_messages::uuid.eq(uuid))
                .filter(system_messages::user_uuid.eq(user_uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_user(user_uuid: &str, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            system_messages::table
                .filter(system_messages::user_uuid.eq(user_uuid))
                .order(system_messages::created_at.desc())
                .load::<Self>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn delete_all_by_user(user_uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(system_messages::table.filter(system_messages::user_uuid.eq(user_uuid)))
                .execute(conn)
                .map_res("Error deleting system messages")
        }}
    }
}
