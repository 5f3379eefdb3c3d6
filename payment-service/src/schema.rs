diesel::table! {
    payments (id) {
        id -> Uuid,
        order_id -> Uuid,
        user_id -> Uuid,
        amount -> Int8,
        currency -> Varchar,
        status -> Varchar,
        external_session_id -> Nullable<Varchar>,
        checkout_url -> Nullable<Varchar>,
        succeeded_at -> Nullable<Timestamptz>,
        failed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
