pub mod clock;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod quality;
pub mod receiver;
pub mod resolver;
pub mod util;
