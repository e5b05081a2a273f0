pub mod connection;
pub mod group;
pub mod registry;

pub use connection::{Connection, ConnectionStats, LinkState};
pub use group::{Group, GroupId};
pub use registry::Registry;
