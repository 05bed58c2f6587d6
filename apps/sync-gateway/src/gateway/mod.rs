pub mod awareness;
pub mod broadcast;
pub mod events;
pub mod handler;
pub mod limiter;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod version;
