//! # hubmesh-server
//!
//! Node-local half of a hub: tracks the clients connected to this process
//! and pushes invocation frames to them. [`ConnectionManager`] implements
//! [`hubmesh_core::LocalDelivery`], which is what the backplane calls on
//! both the publishing and the receiving side.

#![deny(unsafe_code)]

pub mod connection;
pub mod manager;

pub use connection::ClientConnection;
pub use manager::{encode_invocation, ConnectionManager, INVOCATION_FRAME_TYPE};
