//! Cached watches.
//!
//! Three flavours share one engine:
//!
//! - [`NodeWatch`]: a single node, including its creation and deletion.
//! - [`ChildrenWatch`]: the immediate children of a node.
//! - [`TreeWatch`]: a node and everything below it.
//!
//! Each keeps a local copy of what it observes and reports every change as a
//! [`WatchEvent`], one per committed write, in commit order.

mod cache;
mod children_watch;
mod node_watch;
mod tree_watch;

pub(crate) use cache::WatchCache;
pub use cache::{WatchEvent, WatchEvents, WatchState};
pub use children_watch::ChildrenWatch;
pub use node_watch::NodeWatch;
pub use tree_watch::TreeWatch;
