pub mod id;
pub mod minute;

pub use id::prefixed_ulid;
pub use minute::truncate_to_minute;
