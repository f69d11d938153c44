//! Response templates.
//!
//! A template is plain text with `(filter|arg|arg)` invocations and `$name` /
//! `$_name` variables, for example:
//!
//! ```text
//! (api|https://example.com/stats)$sender has (api.points) points, (random.online.viewer) wins!
//! ```
//!
//! `parse` builds a `NodeTree`; `ResponseEngine::render` evaluates it.

mod context;
mod evaluator;
mod filters;
pub mod math;
mod parser;

pub use context::{RenderContext, RenderOutput};
pub use evaluator::ResponseEngine;
pub use filters::{
    Filter, FilterArgs, FilterKind, FilterOutput, FilterRegistry, RandomScope, RegistryError,
};
pub use parser::{parse, Node, NodeId, NodeTree};
