diesel::table! {
    cleaned_prices (id) {
        id -> Int8,
        coin_id -> Int8,
        name -> Text,
        symbol -> Text,
        cmc_rank -> Nullable<Int8>,
        price -> Nullable<Float8>,
        volume_24h -> Nullable<Float8>,
        market_cap -> Nullable<Float8>,
        percent_change_1h -> Nullable<Float8>,
        percent_change_24h -> Nullable<Float8>,
        percent_change_7d -> Nullable<Float8>,
        last_updated_utc -> Nullable<Timestamptz>,
        timestamp_utc -> Timestamptz,
    }
}
