pub mod chat;
pub mod events;
pub mod metadata;
pub mod payload;
pub mod session;
