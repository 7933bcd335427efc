mod audit_event;
mod event;
mod guest_registration;
mod program;
mod registration;
mod system_message;
mod user;

pub use self::audit_event::{AuditEvent, AuditEventType};
pub use self::event::{
    workshop_group_leader_role, Event, EventFormat, EventRole, EventStatus, OrganizerDetail, WORKSHOP_EVENT_TYPE,
    WORKSHOP_GROUPS,
};
pub use self::guest_registration::GuestRegistration;
pub use self::program::{EventProgram, Program, ProgramPurchase};
pub use self::registration::{AuditTrailEntry, Registration};
pub use self::system_message::SystemMessage;
pub use self::user::{User, UserRole};
