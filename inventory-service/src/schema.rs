diesel::table! {
    inventory (product_id) {
        product_id -> Uuid,
        available -> Int4,
        reserved -> Int4,
        threshold -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    inventory,
    reservations,
);
