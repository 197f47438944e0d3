//! Gatehouse is an upload-intercepting reverse proxy.
//!
//! Every request is forwarded to a single upstream through an ordered
//! chain of request directors. Requests that hit an upload route and
//! carry a multipart body are rewritten first: file parts are stored out
//! of band and replaced by reference fields, and the list of rewritten
//! fields travels to the upstream as a signed JWT header. A request is
//! either rewritten in full or rejected with a classified status code.
//!
//! # Architecture
//!
//! - [`cli`] -- Command-line argument parsing with clap derive macros.
//! - [`cmd`] -- Subcommand dispatch and execution (run, validate, health).
//! - [`config`] -- Configuration loading, validation and fingerprinting.
//! - [`error`] -- Process-level error types using `thiserror`.
//! - [`health`] -- `GET /-/health` endpoint handler returning runtime diagnostics.
//! - [`logging`] -- Structured tracing setup with JSON and pretty-print output.
//! - [`proxy`] -- The gateway: route matching, director chain, header
//!   directors and the upstream transport.
//! - [`server`] -- Axum server setup, shared application state and graceful
//!   shutdown.
//! - [`upload`] -- Multipart interception: the rewrite loop, processors,
//!   storage, authorization and the signed rewritten-fields claim.
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `yaml` | YAML config file support _(enabled by default)_ |
//! | `json` | JSON config file support |
//! | `toml` | TOML config file support |
//! | `file-backends` | All file format backends |
//! | `full` | All features |

// Binary crate: public functions are internal, not consumed by external users.
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod upload;
