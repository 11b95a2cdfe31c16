//! HTTP surface: client-facing routing API, realtime session upgrade, and the
//! administrative API. Opaque to the routing/pipeline core per SPEC §9b — this
//! module only translates HTTP requests into calls against `RouterOrchestrator`
//! and `SessionManager` and serializes their results back out.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod health;
pub mod rate_limit;
pub mod request_id;
