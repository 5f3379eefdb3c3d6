diesel::table! {
    orders (id) {
        id -> Uuid,
        user_id -> Uuid,
        amount -> Int8,
        status -> Varchar,
        order_number -> Varchar,
        idempotency_key -> Nullable<Varchar>,
        created_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        canceled_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        unit_price -> Int8,
    }
}

diesel::joinable!(order_items -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    orders,
    order_items,
);
