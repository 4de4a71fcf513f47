pub mod events;
pub mod handler;
pub mod realip;
pub mod registry;
pub mod server;
pub mod session;
