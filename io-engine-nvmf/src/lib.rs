//! Core of an NVMe-over-Fabrics target: subsystem/namespace/controller
//! model, DH-CHAP in-band authentication and persistent reservations.
//!
//! Wire transports, the RPC/CLI surface and concrete block device backends
//! are external collaborators (see [`bdev`]); this crate only implements
//! the core state machines and data model that sit in front of them.

pub mod auth;
pub mod bdev;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod keyring;
pub mod nqn;
pub mod reservation;
pub mod runtime;
pub mod subsystem;
pub mod wire;

pub use error::{Error, ErrorKind};

/// Install a `tracing-subscriber` `fmt` layer driven by `RUST_LOG`,
/// matching teacher's `rest/service/src/main.rs` bootstrap. Embedding
/// binaries call this once at startup; `#[tokio::test]` integration
/// tests call it too so `RUST_LOG=debug cargo test` surfaces the same
/// lifecycle/reservation/auth logging this crate emits in production.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}
