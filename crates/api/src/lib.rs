//! Operator HTTP surface for the notification queue.

pub mod routes;
pub mod state;
