//! Types shared between the trip proxy server and the client core.

pub mod api;
pub mod events;
pub mod models;
