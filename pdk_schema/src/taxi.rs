//! Built-in descriptor for the NYC taxi trip CSV files.
//!
//! Trip files come from different years with slightly different header rows, so
//! columns are always named by position.
use crate::{FieldSpec, SchemaDescriptor};

const COLUMN_NAMES: &[&str] = &[
    "vendor_id",
    "pickup_datetime",
    "dropoff_datetime",
    "store_and_fwd_flag",
    "rate_code",
    "pickup_longitude",
    "pickup_latitude",
    "dropoff_longitude",
    "dropoff_latitude",
    "passenger_count",
    "trip_distance",
    "fare_amount",
    "extra",
    "mta_tax",
    "tip_amount",
    "tolls_amount",
    "ehail_fee",
    "total_amount",
    "payment_type",
    "trip_type",
];

const PRIMARY_KEY_FIELDS: &[&str] = &[
    "vendor_id",
    "pickup_datetime",
    "dropoff_datetime",
    "pickup_longitude",
    "pickup_latitude",
];

/// Coordinates are stored with five decimal digits.
const COORDINATE_SCALE: f64 = 100_000.0;
/// Money and distances are stored in cents and hundredths of a mile.
const AMOUNT_SCALE: f64 = 100.0;

/// Positional column names of a trip file.
pub fn column_names() -> Vec<String> {
    COLUMN_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Fields that identify a trip when no id column exists.
pub fn primary_key_fields() -> Vec<String> {
    PRIMARY_KEY_FIELDS.iter().map(|s| s.to_string()).collect()
}

pub fn descriptor() -> SchemaDescriptor {
    let coordinate = |name: &str, bound: i64| {
        FieldSpec::float(name)
            .with_scale(COORDINATE_SCALE, 0.0)
            .with_range(-bound, bound)
    };
    let amount = |name: &str| {
        FieldSpec::float(name)
            .with_scale(AMOUNT_SCALE, 0.0)
            .with_range(-1_000_000, 100_000_000)
    };

    let fields = vec![
        FieldSpec::string("vendor_id"),
        FieldSpec::timestamp("pickup_datetime"),
        FieldSpec::string("store_and_fwd_flag"),
        FieldSpec::int("rate_code"),
        coordinate("pickup_longitude", 18_000_000),
        coordinate("pickup_latitude", 9_000_000),
        coordinate("dropoff_longitude", 18_000_000),
        coordinate("dropoff_latitude", 9_000_000),
        FieldSpec::int("passenger_count"),
        amount("trip_distance"),
        amount("fare_amount"),
        amount("tip_amount"),
        amount("total_amount"),
        FieldSpec::string("payment_type"),
        FieldSpec::string("trip_type"),
    ];

    // The preset is static, validation can only fail on a programming error.
    SchemaDescriptor::new(fields).unwrap_or_else(|err| panic!("invalid taxi descriptor: {err}"))
}
