//! Dynconfig Core
//!
//! This crate provides the reactive configuration engine used by telemetry
//! SDK plugins. It implements:
//!
//! - Tracked configuration containers with per-field policies
//! - Dependency tracking for change listeners
//! - Batched, deferred change notification
//! - Defaults trees with validators, fallbacks and transforms
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `tree`: Values, containers and the conversion guard
//! - `dynamic`: Handlers, listeners, defaults and flush scheduling
//! - `diagnostics`: Internal diagnostics routed to an injected logger
//! - `error`: The crate-wide error type
//!
//! # Example
//!
//! ```rust,ignore
//! use dynconfig_core::{create_dynamic_config, df_string, Defaults};
//!
//! let defaults = Defaults::new().with("endpointUrl", df_string("https://default"));
//! let handler = create_dynamic_config(serde_json::json!({}), Some(&defaults), None, true)?;
//!
//! let seen = handler.watch(|details| {
//!     println!("endpoint: {:?}", details.cfg.get("endpointUrl"));
//!     Ok(())
//! })?;
//! // Prints "endpoint: https://default"
//!
//! handler.root().set("endpointUrl", "https://other")?;
//! handler.notify()?;
//! // Prints "endpoint: https://other"
//!
//! seen.rm();
//! ```

pub mod diagnostics;
pub mod dynamic;
pub mod error;
pub mod tree;

pub use diagnostics::{Diagnostic, DiagnosticLogger, MemoryLogger, MessageId, Severity, TracingLogger};
pub use dynamic::{
    create_dynamic_config, df_blk_val, df_boolean, df_merge, df_number, df_read_only, df_ref,
    df_set, df_string, df_validate, get_dynamic_config_handler, on_config_change, ConfigBuilder,
    ConfigDetails, ConfigHandler, DefaultField, DefaultValue, Defaults, ManualScheduler,
    Scheduler, ThreadScheduler, TokioScheduler, WatcherHandle,
};
pub use error::{Error, Result};
pub use tree::{
    block_dynamic_conversion, can_convert, deep_copy, force_dynamic_conversion, FieldPolicy,
    Node, NodeKind, Opaque, Value,
};
