//! saftbus broker - object registry, request dispatch and signal fan-out
//!
//! This crate provides the core infrastructure for the saftbus daemon:
//! - `broker` - actor owning the object registry, signal channels and client state
//! - `server` - Unix socket server accepting clients over the rendezvous socket
//! - `service` - the `ServiceObject` trait implemented by hosted objects
//! - `config` - TOML configuration, including where the daemon keeps its state
//! - `pidfile` - PID file used by `saftbusd stop` and `saftbusd status`
//! - `demo` - a small `Counter` object for trying the bus out
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       saftbusd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   BusServer     │────▶│       BrokerActor           │   │
//! │  │ (Unix Socket)   │     │ (registry + path index)     │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ private sockets             │ signal frames     │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│     │   signal pipes              │   │
//! │  │  (per client)   │     │   (one per client proxy)    │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broker;
pub mod config;
pub mod demo;
pub mod pidfile;
pub mod server;
pub mod service;
