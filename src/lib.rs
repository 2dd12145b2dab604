//! apns-h2 - APNs provider client over a hand-written HTTP/2 engine
//!
//! This crate provides an HTTP/2 stream multiplexer running over a single
//! certificate-authenticated TLS connection, and an Apple Push Notification
//! service client (connection lifecycle, request mapping, retry) built on it.

pub mod apns;
pub mod http;
