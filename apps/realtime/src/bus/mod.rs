pub mod connection;
pub mod frame;
pub mod registry;
pub mod supervisor;
pub mod topics;
pub mod transport;
