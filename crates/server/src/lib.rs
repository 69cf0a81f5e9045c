pub mod auth;
pub mod bridge;
pub mod gateway;
pub mod sockets;
