//! Endpoint handlers. Handlers parse, call one orchestration method,
//! and return its result; no synthesis logic lives here.

pub mod chat;
pub mod compliance;
pub mod health;
pub mod medical;
pub mod session;
