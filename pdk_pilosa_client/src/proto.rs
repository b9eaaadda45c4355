//! Protobuf messages of the import endpoint.
//!
//! Keys are sent as bytes. The server declares them as strings, both share the
//! same wire encoding.

#[derive(Clone, PartialEq, prost::Message)]
pub struct ImportRequest {
    #[prost(string, tag = "1")]
    pub index: String,
    #[prost(string, tag = "2")]
    pub field: String,
    #[prost(uint64, tag = "3")]
    pub shard: u64,
    #[prost(uint64, repeated, tag = "4")]
    pub row_ids: Vec<u64>,
    #[prost(uint64, repeated, tag = "5")]
    pub column_ids: Vec<u64>,
    /// Nanoseconds since the Unix epoch.
    #[prost(int64, repeated, tag = "6")]
    pub timestamps: Vec<i64>,
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub row_keys: Vec<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "8")]
    pub column_keys: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ImportValueRequest {
    #[prost(string, tag = "1")]
    pub index: String,
    #[prost(string, tag = "2")]
    pub field: String,
    #[prost(uint64, tag = "3")]
    pub shard: u64,
    #[prost(uint64, repeated, tag = "5")]
    pub column_ids: Vec<u64>,
    #[prost(int64, repeated, tag = "6")]
    pub values: Vec<i64>,
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub column_keys: Vec<Vec<u8>>,
}
