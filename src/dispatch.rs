//
// Fire-and-forget side effects: emails, system messages, audit entries
//

use std::sync::{
    atomic::{AtomicU64, Ordering},
    OnceLock,
};

use tokio::sync::mpsc;

use crate::{
    db::{
        models::{AuditEvent, AuditEventType, Event, GuestRegistration, Registration, SystemMessage, User},
        DbConn, DbPool,
    },
    error::Error,
    mail,
    util::dedup_by_email,
    CONFIG,
};

/// A business event whose follow-up (the email + system message + audit
/// "trio") happens outside the caller's request. Failures are logged and
/// counted, never propagated back into the engine.
#[derive(Debug)]
pub enum SideEffect {
    SignupConfirmed {
        event_uuid: String,
        user_uuid: String,
        role_name: String,
    },
    RegistrationCancelled {
        event_uuid: String,
        user_uuid: String,
        role_name: String,
        actor_uuid: String,
    },
    UserRemoved {
        event_uuid: String,
        user_uuid: String,
        role_name: String,
        actor_uuid: String,
    },
    UserMoved {
        event_uuid: String,
        user_uuid: String,
        from_role_name: String,
        to_role_name: String,
        actor_uuid: String,
    },
    RoleInvitation {
        event_uuid: String,
        user_uuid: String,
        role_name: String,
        actor_uuid: String,
        decline_token: String,
    },
    InvitationDeclined {
        event_uuid: String,
        user_uuid: String,
        role_name: String,
    },
    EventUpdated {
        event_uuid: String,
        actor_uuid: String,
        new_co_organizer_uuids: Vec<String>,
        auto_unpublished: bool,
        missing_fields: Vec<String>,
    },
    WorkshopTopicUpdated {
        event_uuid: String,
        group: String,
        actor_uuid: String,
    },
}

static SIDE_EFFECTS: OnceLock<mpsc::UnboundedSender<SideEffect>> = OnceLock::new();
static FAILED_EFFECTS: AtomicU64 = AtomicU64::new(0);

pub fn failed_effects() -> u64 {
    FAILED_EFFECTS.load(Ordering::Relaxed)
}

/// Spawns the worker draining the side-effect queue. Must be called once
/// during launch, before the first request is served.
pub fn start_side_effect_dispatcher(pool: DbPool) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    if SIDE_EFFECTS.set(tx).is_err() {
        error!("Tried to start the side effect dispatcher more than once.");
        return;
    }

    tokio::spawn(async move {
        while let Some(effect) = rx.recv().await {
            if let Err(e) = handle_effect(effect, &pool).await {
                FAILED_EFFECTS.fetch_add(1, Ordering::Relaxed);
                error!("Side effect failed: {e:#?}");
            }
        }
    });
}

/// Enqueues without waiting; the caller's response never blocks on mail.
pub fn dispatch(effect: SideEffect) {
    match SIDE_EFFECTS.get() {
        Some(tx) => {
            if tx.send(effect).is_err() {
                warn!("Side effect dropped, the dispatcher worker is gone");
            }
        }
        None => warn!("Side effect dropped, the dispatcher was never started"),
    }
}

async fn handle_effect(effect: SideEffect, pool: &DbPool) -> Result<(), Error> {
    let conn = pool.get().await?;

    match effect {
        SideEffect::SignupConfirmed {
            event_uuid,
            user_uuid,
            role_name,
        } => {
            let (event, user) = load_event_and_user(&event_uuid, &user_uuid, &conn).await?;

            if CONFIG.mail_enabled() {
                if let Err(e) = mail::send_signup_confirmation(
                    &user.email,
                    &user.name,
                    &event.title,
                    &role_name,
                    &event.date,
                    &event.time,
                )
                .await
                {
                    error!("Error sending signup confirmation email: {e:#?}");
                }
            }

            system_message(
                &user.uuid,
                format!("Signed up for {}", event.title),
                format!("You are registered as {} on {} at {}.", role_name, event.date, event.time),
                "registration",
                &conn,
            )
            .await;

            audit(AuditEventType::UserSignedUp, &event.uuid, Some(&user.uuid), Some(&user.uuid), &conn).await;
        }

        SideEffect::RegistrationCancelled {
            event_uuid,
            user_uuid,
            role_name,
            actor_uuid,
        } => {
            let (event, user) = load_event_and_user(&event_uuid, &user_uuid, &conn).await?;

            if CONFIG.mail_enabled() {
                if let Err(e) =
                    mail::send_registration_cancelled(&user.email, &user.name, &event.title, &role_name).await
                {
                    error!("Error sending cancellation email: {e:#?}");
                }
            }

            system_message(
                &user.uuid,
                format!("Registration cancelled for {}", event.title),
                format!("Your {} registration was cancelled.", role_name),
                "registration",
                &conn,
            )
            .await;

            audit(AuditEventType::UserCancelled, &event.uuid, Some(&user.uuid), Some(&actor_uuid), &conn).await;
        }

        SideEffect::UserRemoved {
            event_uuid,
            user_uuid,
            role_name,
            actor_uuid,
        } => {
            let (event, user) = load_event_and_user(&event_uuid, &user_uuid, &conn).await?;

            if CONFIG.mail_enabled() {
                if let Err(e) = mail::send_removed_from_role(&user.email, &user.name, &event.title, &role_name).await {
                    error!("Error sending removal email: {e:#?}");
                }
            }

            system_message(
                &user.uuid,
                format!("Removed from {}", event.title),
                format!("An organizer removed you from the {} role.", role_name),
                "registration",
                &conn,
            )
            .await;

            audit(AuditEventType::UserRemoved, &event.uuid, Some(&user.uuid), Some(&actor_uuid), &conn).await;
        }

        SideEffect::UserMoved {
            event_uuid,
            user_uuid,
            from_role_name,
            to_role_name,
            actor_uuid,
        } => {
            let (event, user) = load_event_and_user(&event_uuid, &user_uuid, &conn).await?;

            system_message(
                &user.uuid,
                format!("Role changed in {}", event.title),
                format!("An organizer moved you from {from_role_name} to {to_role_name}."),
                "registration",
                &conn,
            )
            .await;

            audit(AuditEventType::UserMoved, &event.uuid, Some(&user.uuid), Some(&actor_uuid), &conn).await;
        }

        SideEffect::RoleInvitation {
            event_uuid,
            user_uuid,
            role_name,
            actor_uuid,
            decline_token,
        } => {
            let (event, user) = load_event_and_user(&event_uuid, &user_uuid, &conn).await?;

            if CONFIG.mail_enabled() {
                if let Err(e) = mail::send_role_invitation(
                    &user.email,
                    &user.name,
                    &event.title,
                    &role_name,
                    &event.date,
                    &event.time,
                    &decline_token,
                )
                .await
                {
                    error!("Error sending role invitation email: {e:#?}");
                }
            }

            system_message(
                &user.uuid,
                format!("You were added to {}", event.title),
                format!(
                    "An organizer signed you up as {} on {} at {}. Use the link in your invitation email to decline.",
                    role_name, event.date, event.time
                ),
                "invitation",
                &conn,
            )
            .await;

            audit(AuditEventType::UserAssigned, &event.uuid, Some(&user.uuid), Some(&actor_uuid), &conn).await;
        }

        SideEffect::InvitationDeclined {
            event_uuid,
            user_uuid,
            role_name,
        } => {
            let (event, user) = load_event_and_user(&event_uuid, &user_uuid, &conn).await?;

            // The organizers get told; the assignee just declined, there is
            // nothing to send them.
            for organizer_uuid in organizer_uuids_with_creator(&event) {
                system_message(
                    &organizer_uuid,
                    format!("Invitation declined for {}", event.title),
                    format!("{} declined the {} role.", user.name, role_name),
                    "invitation",
                    &conn,
                )
                .await;
            }

            audit(AuditEventType::UserDeclined, &event.uuid, Some(&user.uuid), Some(&user.uuid), &conn).await;
        }

        SideEffect::EventUpdated {
            event_uuid,
            actor_uuid,
            new_co_organizer_uuids,
            auto_unpublished,
            missing_fields,
        } => {
            let Some(event) = Event::find_by_uuid(&event_uuid, &conn).await else {
                err!(format!("Event {event_uuid} vanished before its update effects ran"))
            };
            let actor_name = match User::find_by_uuid(&actor_uuid, &conn).await {
                Some(actor) => actor.name,
                None => String::from("An organizer"),
            };

            // Freshly added co-organizers get a dedicated notice.
            for co_uuid in &new_co_organizer_uuids {
                if let Some(co) = User::find_by_uuid(co_uuid, &conn).await {
                    if CONFIG.mail_enabled() {
                        if let Err(e) =
                            mail::send_co_organizer_added(&co.email, &co.name, &event.title, &actor_name).await
                        {
                            error!("Error sending co-organizer email: {e:#?}");
                        }
                    }
                    system_message(
                        &co.uuid,
                        format!("You now co-organize {}", event.title),
                        format!("{} added you as a co-organizer.", actor_name),
                        "organizer",
                        &conn,
                    )
                    .await;
                }
            }

            // Participants and guests, deduped by email: someone present in
            // both lists hears about the update once.
            notify_participants_and_guests(&event, &conn).await;

            if auto_unpublished {
                let missing: Vec<&str> = missing_fields.iter().map(String::as_str).collect();
                for organizer_uuid in organizer_uuids_with_creator(&event) {
                    if let Some(organizer) = User::find_by_uuid(&organizer_uuid, &conn).await {
                        if CONFIG.mail_enabled() {
                            if let Err(e) =
                                mail::send_event_auto_unpublished(&organizer.email, &event.title, &missing).await
                            {
                                error!("Error sending auto-unpublish email: {e:#?}");
                            }
                        }
                        system_message(
                            &organizer.uuid,
                            format!("{} was unpublished", event.title),
                            format!("Required fields are missing: {}.", missing.join(", ")),
                            "publishing",
                            &conn,
                        )
                        .await;
                    }
                }
                audit(AuditEventType::EventAutoUnpublished, &event.uuid, None, Some(&actor_uuid), &conn).await;
            }

            audit(AuditEventType::EventUpdated, &event.uuid, None, Some(&actor_uuid), &conn).await;
        }

        SideEffect::WorkshopTopicUpdated {
            event_uuid,
            group,
            actor_uuid,
        } => {
            debug!("Workshop group {group} topic updated on event {event_uuid}");
            audit(AuditEventType::WorkshopTopicUpdated, &event_uuid, None, Some(&actor_uuid), &conn).await;
        }
    }

    Ok(())
}

struct Recipient {
    user_uuid: Option<String>,
    name: String,
    email: String,
}

async fn notify_participants_and_guests(event: &Event, conn: &DbConn) {
    let mut recipients: Vec<Recipient> = Vec::new();

    for registration in Registration::find_by_event(&event.uuid, conn).await {
        if let Some(user) = User::find_by_uuid(&registration.user_uuid, conn).await {
            recipients.push(Recipient {
                user_uuid: Some(user.uuid),
                name: user.name,
                email: user.email,
            });
        }
    }

    for guest in GuestRegistration::find_by_event(&event.uuid, conn).await {
        recipients.push(Recipient {
            user_uuid: None,
            name: guest.full_name,
            email: guest.email,
        });
    }

    for recipient in dedup_by_email(recipients, |r| r.email.clone()) {
        if CONFIG.mail_enabled() {
            if let Err(e) = mail::send_event_updated(&recipient.email, &event.title, &event.date, &event.time).await {
                error!("Error sending event update email to {}: {e:#?}", recipient.name);
            }
        }
        if let Some(user_uuid) = recipient.user_uuid {
            system_message(
                &user_uuid,
                format!("{} was updated", event.title),
                format!("The details of {} changed. Check the event page for the latest information.", event.title),
                "event",
                conn,
            )
            .await;
        }
    }
}

fn organizer_uuids_with_creator(event: &Event) -> Vec<String> {
    let mut uuids = event.organizer_uuids();
    if !uuids.contains(&event.created_by) {
        uuids.insert(0, event.created_by.clone());
    }
    uuids
}

async fn load_event_and_user(event_uuid: &str, user_uuid: &str, conn: &DbConn) -> Result<(Event, User), Error> {
    let Some(event) = Event::find_by_uuid(event_uuid, conn).await else {
        err!(format!("Event {event_uuid} vanished before its side effects ran"))
    };
    let Some(user) = User::find_by_uuid(user_uuid, conn).await else {
        err!(format!("User {user_uuid} vanished before their side effects ran"))
    };
    Ok((event, user))
}

async fn system_message(user_uuid: &str, title: String, body: String, kind: &str, conn: &DbConn) {
    let message = SystemMessage::new(user_uuid.to_string(), title, body, kind.to_string());
    if let Err(e) = message.save(conn).await {
        error!("Error saving system message: {e:#?}");
    }
}

async fn audit(atype: AuditEventType, event_uuid: &str, user_uuid: Option<&str>, actor_uuid: Option<&str>, conn: &DbConn) {
    let mut entry = AuditEvent::new(atype, Some(event_uuid.to_string()));
    entry.user_uuid = user_uuid.map(ToString::to_string);
    entry.act_user_uuid = actor_uuid.map(ToString::to_string);
    if let Err(e) = entry.save(conn).await {
        error!("Error saving audit event: {e:#?}");
    }
}
