//! HTTP handlers for the relay: the birthdate change operation and the liveness probe.

pub mod birthdate;
pub mod health;
