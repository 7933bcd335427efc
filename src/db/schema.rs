diesel::table! {
    users (uuid) {
        uuid -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        email -> Text,
        name -> Text,
        avatar_url -> Nullable<Text>,
        atype -> Integer,
        is_active -> Bool,
        is_verified -> Bool,
    }
}

diesel::table! {
    events (uuid) {
        uuid -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        title -> Text,
        event_type -> Text,
        category -> Nullable<Text>,
        date -> Text,
        end_date -> Text,
        time -> Text,
        end_time -> Text,
        time_zone -> Nullable<Text>,
        format -> Text,
        location -> Nullable<Text>,
        zoom_link -> Nullable<Text>,
        meeting_id -> Nullable<Text>,
        passcode -> Nullable<Text>,
        purpose -> Nullable<Text>,
        status -> Integer,
        publish -> Bool,
        auto_unpublished_reason -> Nullable<Text>,
        auto_unpublished_at -> Nullable<Timestamp>,
        workshop_group_topics -> Nullable<Text>,
        total_slots -> Integer,
        signed_up -> Integer,
        created_by -> Text,
        organizer_details -> Text,
    }
}

diesel::table! {
    event_roles (uuid) {
        uuid -> Text,
        event_uuid -> Text,
        name -> Text,
        description -> Text,
        max_participants -> Integer,
        open_to_public -> Bool,
        agenda -> Nullable<Text>,
        start_time -> Nullable<Text>,
        end_time -> Nullable<Text>,
        sort_order -> Integer,
    }
}

diesel::table! {
    registrations (uuid) {
        uuid -> Text,
        event_uuid -> Text,
        user_uuid -> Text,
        role_uuid -> Text,
        registration_date -> Timestamp,
        notes -> Nullable<Text>,
        special_requirements -> Nullable<Text>,
        registered_by -> Text,
        user_snapshot -> Text,
        event_snapshot -> Text,
        audit_trail -> Text,
    }
}

diesel::table! {
    guest_registrations (uuid) {
        uuid -> Text,
        event_uuid -> Text,
        role_uuid -> Text,
        full_name -> Text,
        email -> Text,
        phone -> Nullable<Text>,
        notes -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    programs (uuid) {
        uuid -> Text,
        title -> Text,
        is_free -> Bool,
        mentors -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    program_purchases (uuid) {
        uuid -> Text,
        program_uuid -> Text,
        user_uuid -> Text,
        is_completed -> Bool,
        created_at -> Timestamp,
    }
}

diesel::table! {
    event_programs (event_uuid, program_uuid) {
        event_uuid -> Text,
        program_uuid -> Text,
    }
}

diesel::table! {
    system_messages (uuid) {
        uuid -> Text,
        user_uuid -> Text,
        title -> Text,
        body -> Text,
        kind -> Text,
        created_at -> Timestamp,
        read_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    audit_events (uuid) {
        uuid -> Text,
        atype -> Integer,
        event_uuid -> Nullable<Text>,
        registration_uuid -> Nullable<Text>,
        user_uuid -> Nullable<Text>,
        act_user_uuid -> Nullable<Text>,
        event_date -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    users,
    events,
    event_roles,
    registrations,
    guest_registrations,
    programs,
    program_purchases,
    event_programs,
    system_messages,
    audit_events,
);
