#![warn(missing_docs)]

//! # hookline-scripts
//!
//! Render lifecycle hooks for the hookline engine.
//!
//! Templates reference scripts that define `beforeRender` and `afterRender`.
//! [`ScriptsEngine`] resolves them (global scripts first), runs each hook in
//! the sandbox strictly in order, and merges what the script changed back into
//! the live request and response. Scripts reach the host only through the
//! proxy actions of an [`ActionCatalog`]: nested renders and read-only store
//! queries, plus whatever handler modules the host installs.
//!
//! ## Guarantees
//!
//! - **Identity is host-owned**: nested renders always run as the original caller
//! - **Bounded nesting**: at most three nested renders per external request
//! - **Ordered side effects**: no two scripts of one request run concurrently
//! - **Typed failures**: [`ScriptsError::kind`] separates caller-facing
//!   conditions from script bugs and engine faults

pub mod context;
pub mod cycle;
pub mod error;
pub mod lifecycle;
pub mod merge;
pub mod pipeline;
pub mod proxy;
pub mod request;
pub mod resolve;
pub mod store;

pub use context::{RequestContext, SharedContext};
pub use cycle::{CycleCounter, MAX_NESTED_RENDERS};
pub use error::{CatalogError, ErrorKind, ScriptsError};
pub use lifecycle::{AfterQueue, LogSink, ScriptsEngine, ScriptsSettings, TracingLogSink};
pub use merge::{deep_merge, MergePolicy};
pub use pipeline::{PlaceholderEngine, RenderPipeline, Renderer, TemplateEngine};
pub use proxy::{ActionCatalog, ActionContext, BoundCatalog, ProxyAction, ProxyHandlerModule};
pub use request::{RenderRequest, RenderResponse, ScriptDescriptor, ScriptRef};
pub use store::{AuthContext, DocumentStore, InMemoryStore, StoreError};
