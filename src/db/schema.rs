diesel::table! {
    users (id) {
        id -> Text,
        name -> Nullable<Text>,
        role -> Nullable<Text>,
    }
}

diesel::table! {
    sessions (token) {
        token -> Text,
        user_id -> Text,
    }
}

diesel::table! {
    notifications (id) {
        id -> Int8,
        recipient_id -> Text,
        read_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(sessions -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(users, sessions, notifications);
