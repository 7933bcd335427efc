use chrono::{NaiveDateTime, Utc};
use num_traits::FromPrimitive;
use serde_json::Value;
use std::cmp::Ordering;

use crate::db::schema::users;

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = users)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct User {
    pub uuid: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,

    pub atype: i32, // UserRole
    pub is_active: bool,
    pub is_verified: bool,
}

/// The authorization levels. Stored as an integer; the numeric order is the
/// access order, so `>=` comparisons against `atype` express "at least".
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum UserRole {
    Participant = 0,
    GuestExpert = 1,
    Leader = 2,
    Administrator = 3,
    SuperAdmin = 4,
}

impl UserRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "0" | "Participant" => Some(UserRole::Participant),
            "1" | "Guest Expert" => Some(UserRole::GuestExpert),
            "2" | "Leader" => Some(UserRole::Leader),
            "3" | "Administrator" => Some(UserRole::Administrator),
            "4" | "Super Admin" => Some(UserRole::SuperAdmin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Participant => "Participant",
            UserRole::GuestExpert => "Guest Expert",
            UserRole::Leader => "Leader",
            UserRole::Administrator => "Administrator",
            UserRole::SuperAdmin => "Super Admin",
        }
    }

    /// How many distinct roles a user of this level may hold within a single
    /// event. `None` means unlimited.
    pub fn role_quota(&self) -> Option<i64> {
        match self {
            UserRole::SuperAdmin | UserRole::Administrator => None,
            UserRole::Leader => Some(5),
            UserRole::GuestExpert => Some(4),
            UserRole::Participant => Some(3),
        }
    }
}

impl Ord for UserRole {
    fn cmp(&self, other: &UserRole) -> Ordering {
        (*self as i32).cmp(&(*other as i32))
    }
}

impl PartialOrd for UserRole {
    fn partial_cmp(&self, other: &UserRole) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq<i32> for UserRole {
    fn eq(&self, other: &i32) -> bool {
        *other == *self as i32
    }
}

impl PartialOrd<i32> for UserRole {
    fn partial_cmp(&self, other: &i32) -> Option<Ordering> {
        if let Some(other) = Self::from_i32(*other) {
            return Some(self.cmp(&other));
        }
        None
    }
}

impl PartialEq<UserRole> for i32 {
    fn eq(&self, other: &UserRole) -> bool {
        *self == *other as i32
    }
}

impl PartialOrd<UserRole> for i32 {
    fn partial_cmp(&self, other: &UserRole) -> Option<Ordering> {
        if let Some(self_role) = UserRole::from_i32(*self) {
            return Some(self_role.cmp(other));
        }
        None
    }

    fn gt(&self, other: &UserRole) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Greater))
    }

    fn ge(&self, other: &UserRole) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Greater) | Some(Ordering::Equal))
    }
}

/// Local methods
impl User {
    pub fn new(email: String, name: String) -> Self {
        let now = Utc::now().naive_utc();
        let email = email.to_lowercase();

        Self {
            uuid: crate::util::get_uuid(),
            created_at: now,
            updated_at: now,
            email,
            name,
            avatar_url: None,

            atype: UserRole::Participant as i32,
            is_active: true,
            is_verified: false,
        }
    }

    pub fn role(&self) -> UserRole {
        UserRole::from_i32(self.atype).unwrap_or(UserRole::Participant)
    }

    /// The per-event ceiling on distinct roles for this user's level.
    pub fn role_quota(&self) -> Option<i64> {
        self.role().role_quota()
    }

    pub fn can_edit_any_event(&self) -> bool {
        self.atype >= UserRole::Administrator
    }

    /// The `MODERATE_EVENT_PARTICIPANTS` permission of the remove flow.
    pub fn can_moderate_participants(&self) -> bool {
        self.atype >= UserRole::Administrator
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "email": self.email,
            "name": self.name,
            "avatarUrl": self.avatar_url,
            "role": self.role().as_str(),
            "isActive": self.is_active,
            "isVerified": self.is_verified,
            "object": "user",
        })
    }

    /// The immutable view of the user captured on every registration.
    pub fn to_snapshot(&self) -> Value {
        json!({
            "userId": self.uuid,
            "name": self.name,
            "email": self.email,
            "role": self.role().as_str(),
        })
    }
}

use crate::api::EmptyResult;
use crate::db::DbConn;
use crate::error::MapResult;

/// Database methods
impl User {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        if !email_address::EmailAddress::is_valid(self.email.trim()) {
            err!(format!("Email {} is not a valid email address", self.email.trim()))
        }

        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(users::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving user")
            }
            postgresql {
                diesel::insert_into(users::table)
                    .values(&*self)
                    .on_conflict(users::uuid)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving user")
            }
        }
    }

    pub async fn delete(self, conn: &DbConn) -> EmptyResult {
        super::Registration::delete_all_by_user(&self.uuid, conn).await?;
        super::SystemMessage::delete_all_by_user(&self.uuid, conn).await?;

        db_run! { conn: {
            diesel::delete(users::table.filter(users::uuid.eq(self.uuid)))
                .execute(conn)
                .map_res("Error deleting user")
        }}
    }

    pub async fn find_by_uuid(uuid: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            users::table
                .filter(users::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_mail(mail: &str, conn: &DbConn) -> Option<Self> {
        let lower_mail = mail.to_lowercase();
        db_run! { conn: {
            users::table
                .filter(users::email.eq(lower_mail))
                .first::<Self>(conn)
                .ok()
        }}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(non_snake_case)]
    fn partial_cmp_UserRole() {
        assert!(UserRole::SuperAdmin > UserRole::Administrator);
        assert!(UserRole::Administrator > UserRole::Leader);
        assert!(UserRole::Leader > UserRole::GuestExpert);
        assert!(UserRole::GuestExpert > UserRole::Participant);

        assert!(3 >= UserRole::Administrator);
        assert!(2 < UserRole::Administrator);
    }

    #[test]
    fn role_quota_table() {
        assert_eq!(UserRole::SuperAdmin.role_quota(), None);
        assert_eq!(UserRole::Administrator.role_quota(), None);
        assert_eq!(UserRole::Leader.role_quota(), Some(5));
        assert_eq!(UserRole::GuestExpert.role_quota(), Some(4));
        assert_eq!(UserRole::Participant.role_quota(), Some(3));
    }

    #[test]
    fn role_round_trips_through_names() {
        for role in [
            UserRole::Participant,
            UserRole::GuestExpert,
            UserRole::Leader,
            UserRole::Administrator,
            UserRole::SuperAdmin,
        ] {
            assert_eq!(UserRole::from_str(role.as_str()), Some(role));
        }
        assert_eq!(UserRole::from_str("Intern"), None);
    }
}
