// Hand-maintained in the style Diesel CLI would generate (no live database
// available to run `diesel print-schema` against in this workspace).

diesel::table! {
    users (id) {
        id -> Uuid,
        telegram_id -> Int8,
        #[max_length = 10]
        gender -> Varchar,
        age -> Int4,
        rating -> Float8,
        is_active -> Bool,
        last_active -> Timestamptz,
    }
}

diesel::table! {
    searches (id) {
        id -> Uuid,
        user_id -> Uuid,
        telegram_id -> Int8,
        #[max_length = 20]
        status -> Varchar,
        #[max_length = 10]
        gender -> Varchar,
        age -> Int4,
        rating -> Float8,
        desired_gender -> Array<Nullable<Text>>,
        desired_age_min -> Int4,
        desired_age_max -> Int4,
        min_acceptable_rating -> Float8,
        use_geolocation -> Bool,
        longitude -> Nullable<Float8>,
        latitude -> Nullable<Float8>,
        max_distance_km -> Nullable<Float8>,
        matched_with_user_id -> Nullable<Uuid>,
        matched_with_telegram_id -> Nullable<Int8>,
        matched_with_chat_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    chats (id) {
        id -> Uuid,
        participants -> Array<Nullable<Uuid>>,
        #[max_length = 20]
        chat_type -> Varchar,
        is_active -> Bool,
        expires_at -> Nullable<Timestamptz>,
        messages -> Jsonb,
        last_message -> Nullable<Text>,
        started_at -> Timestamptz,
        ended_at -> Nullable<Timestamptz>,
        ended_by -> Nullable<Uuid>,
        #[max_length = 50]
        end_reason -> Nullable<Varchar>,
    }
}

diesel::table! {
    ratings (id) {
        id -> Uuid,
        rated_user_id -> Uuid,
        rater_user_id -> Uuid,
        chat_id -> Uuid,
        score -> Int4,
        comment -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(users, searches, chats, ratings,);
