use chrono::{NaiveDateTime, Utc};
use serde_json::Value;

use super::User;
use crate::db::schema::{event_programs, program_purchases, programs};

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = programs)]
#[diesel(primary_key(uuid))]
pub struct Program {
    pub uuid: String,
    pub title: String,
    pub is_free: bool,
    // JSON array of mentor user uuids, a display-free access list
    pub mentors: String,
    pub created_at: NaiveDateTime,
}

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = program_purchases)]
#[diesel(primary_key(uuid))]
pub struct ProgramPurchase {
    pub uuid: String,
    pub program_uuid: String,
    pub user_uuid: String,
    pub is_completed: bool,
    pub created_at: NaiveDateTime,
}

/// The inverse side of `Event.programLabels`; kept in sync after event saves.
#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = event_programs)]
#[diesel(primary_key(event_uuid, program_uuid))]
pub struct EventProgram {
    pub event_uuid: String,
    pub program_uuid: String,
}

/// Local methods
impl Program {
    pub fn new(title: String, is_free: bool) -> Self {
        Self {
            uuid: crate::util::get_uuid(),
            title,
            is_free,
            mentors: String::from("[]"),
            created_at: Utc::now().naive_utc(),
        }
    }

    pub fn mentor_uuids(&self) -> Vec<String> {
        serde_json::from_str(&self.mentors).unwrap_or_default()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "title": self.title,
            "isFree": self.is_free,
            "object": "program",
        })
    }
}

/// Local methods
impl ProgramPurchase {
    pub fn new(program_uuid: String, user_uuid: String) -> Self {
        Self {
            uuid: crate::util::get_uuid(),
            program_uuid,
            user_uuid,
            is_completed: true,
            created_at: Utc::now().naive_utc(),
        }
    }
}

use crate::api::EmptyResult;
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl Program {
    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(programs::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving program")
            }
            postgresql {
                diesel::insert_into(programs::table)
                    .values(self)
                    .on_conflict(programs::uuid)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving program")
            }
        }
    }

    pub async fn find_by_uuid(uuid: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            programs::table
                .filter(programs::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Whether the user may link events to this program: the program is
    /// free, or they mentor it, or they completed a purchase of it.
    pub async fn is_accessible_to(&self, user: &User, conn: &DbConn) -> bool {
        if self.is_free {
            return true;
        }
        if self.mentor_uuids().iter().any(|m| m == &user.uuid) {
            return true;
        }
        ProgramPurchase::completed_exists(&self.uuid, &user.uuid, conn).await
    }
}

/// Database methods
impl ProgramPurchase {
    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(program_purchases::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving program purchase")
            }
            postgresql {
                diesel::insert_into(program_purchases::table)
                    .values(self)
                    .on_conflict(program_purchases::uuid)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving program purchase")
            }
        }
    }

    pub async fn completed_exists(program_uuid: &str, user_uuid: &str, conn: &DbConn) -> bool {
        db_run! { conn: {
            program_purchases::table
                .filter(program_purchases::program_uuid.eq(program_uuid))
                .filter(program_purchases::user_uuid.eq(user_uuid))
                .filter(program_purchases::is_completed.eq(true))
                .count()
                .first::<i64>(conn)
                .unwrap_or(0) != 0
        }}
    }
}

/// Database methods
impl EventProgram {
    pub async fn find_program_uuids(event_uuid: &str, conn: &DbConn) -> Vec<String> {
        db_run! { conn: {
            event_programs::table
                .filter(event_programs::event_uuid.eq(event_uuid))
                .select(event_programs::program_uuid)
                .load::<String>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn find_event_uuids(program_uuid: &str, conn: &DbConn) -> Vec<String> {
        db_run! { conn: {
            event_programs::table
                .filter(event_programs::program_uuid.eq(program_uuid))
                .select(event_programs::event_uuid)
                .load::<String>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn delete_all_by_event(event_uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(event_programs::table.filter(event_programs::event_uuid.eq(event_uuid)))
                .execute(conn)
                .map_res("Error deleting event program links")
        }}
    }

    /// Synchronizes the inverse program links after an event save: removed
    /// programs are pulled, added ones inserted. Not transactional with the
    /// event save; a partial failure is logged and left to reconciliation.
    pub async fn sync_for_event(event_uuid: &str, program_uuids: &[String], conn: &DbConn) -> EmptyResult {
        let existing = Self::find_program_uuids(event_uuid, conn).await;

        for removed in existing.iter().filter(|p| !program_uuids.contains(p)) {
            Self::unlink(event_uuid, removed, conn).await?;
        }

        for added in program_uuids.iter().filter(|p| !existing.contains(p)) {
            Self::link(event_uuid, added, conn).await?;
        }

        Ok(())
    }

    async fn unlink(event_uuid: &str, program_uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(
                event_programs::table
                    .filter(event_programs::event_uuid.eq(event_uuid))
                    .filter(event_programs::program_uuid.eq(program_uuid)),
            )
            .execute(conn)
            .map_res("Error unlinking program from event")
        }}
    }

    async fn link(event_uuid: &str, program_uuid: &str, conn: &DbConn) -> EmptyResult {
        let link = EventProgram {
            event_uuid: event_uuid.to_string(),
            program_uuid: program_uuid.to_string(),
        };
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(event_programs::table)
                    .values(&link)
                    .execute(conn)
                    .map_res("Error linking program to event")
            }
            postgresql {
                diesel::insert_into(event_programs::table)
                    .values(&link)
                    .on_conflict((event_programs::event_uuid, event_programs::program_uuid))
                    .do_nothing()
                    .execute(conn)
                    .map_res("Error linking program to event")
            }
        }
    }
}
