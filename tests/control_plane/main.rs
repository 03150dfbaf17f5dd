//! Control plane integration tests
//!
//! Each test drives a `ControlPlane` backed by the in-memory packet filter
//! with its JSON state in a temporary directory.
//!
//! Run with: cargo test --test control_plane

mod harness;

mod dhcp;
mod rules;
mod zones;
