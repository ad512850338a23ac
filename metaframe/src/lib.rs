//! metaframe: reactive data-source orchestration for metadata-driven UIs
//!
//! Declarative window/data-source descriptors, bound at run time to live
//! data and remote services: per-window reactive cells, dependency
//! propagation between sources, race-safe fetch/refresh with stable
//! selection, and awaitable dialog/window commits.
//!
//! # Example
//! ```ignore
//! use metaframe::prelude::*;
//!
//! let mut engine = Engine::new();
//! let window_id = engine.open_window(metadata, WindowSpec {
//!     key: "customers".into(),
//!     ..WindowSpec::default()
//! })?;
//! engine.run_until_idle().await;
//! ```

// Re-export everything from core
pub use metaframe_core::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use metaframe_core::prelude::*;

    // Lifecycle
    pub use metaframe_core::{OpenOptions, PendingResult, WindowSpec, WindowState};

    // Command bridge
    pub use metaframe_core::{CommandSpec, command_specs, dispatch_command};

    // Testing
    pub use metaframe_core::{Harness, StaticConnector};
}
