//! Dynamic Configuration
//!
//! This module turns a configuration tree into a live one:
//!
//! - **Handler**: owns listeners and runs batched notifications
//! - **Listener**: a callback re-run when a field it read changes
//! - **Defaults**: fallback values and field policies
//! - **Scheduler**: decides when a deferred flush runs
//!
//! # Example
//!
//! ```rust,ignore
//! use dynconfig_core::dynamic::{create_dynamic_config, on_config_change};
//!
//! let handler = create_dynamic_config(serde_json::json!({ "level": 1 }), None, None, true)?;
//!
//! on_config_change(&handler.cfg(), |details| {
//!     println!("level = {:?}", details.cfg.get("level"));
//!     Ok(())
//! })?;
//!
//! handler.root().set("level", 2)?;
//! handler.notify()?; // prints "level = 2"
//! ```

mod defaults;
mod handler;
mod listener;
mod scheduler;
mod tracking;

pub use defaults::{
    df_blk_val, df_boolean, df_merge, df_number, df_read_only, df_ref, df_set, df_string,
    df_validate, DefaultField, DefaultValue, Defaults, Transform, Validator,
};
pub use handler::{
    create_dynamic_config, get_dynamic_config_handler, on_config_change, ConfigBuilder,
    ConfigDetails, ConfigHandler, HandlerId,
};
pub use listener::{ListenerId, WatcherHandle};
pub use scheduler::{
    default_scheduler, ManualScheduler, Scheduler, Task, ThreadScheduler, TokioScheduler,
};
pub use tracking::TrackingContext;

pub(crate) use handler::HandlerCore;
pub(crate) use listener::Watcher;
