pub mod connection_limit;

pub use connection_limit::{CallSlot, connection_limit_middleware};
