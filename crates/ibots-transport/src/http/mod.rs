//! GraphQL-over-HTTP transport.
//!
//! Bots log in with a form post to `/ibis/login-pass/`, which sets session
//! cookies, and then issue every query and mutation against `/graphql/`.
//!
//! Network failures, `5xx` and `429` responses are transient. GraphQL-level
//! `errors` are rejections: the platform understood the request and refused it.

mod client;
mod graphql;

pub use client::{HttpConnector, HttpSession};
