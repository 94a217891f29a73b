//! Control-flow steps produced by the builder's composite methods.
//!
//! Composites that run nested workflows (switch cases, loop bodies, fork
//! branches, sub-workflows) build them from the environment of the run they
//! execute in, found through the `RunHandle` singleton in the context.

mod conditional;
mod for_each;
mod fork;
mod primitives;
mod switch;

pub use conditional::Conditional;
pub use for_each::{CURRENT_INDEX_KEY, CURRENT_ITEM_KEY, ForEach, ItemAction, ItemSelector, LoopBody};
pub use fork::{Fork, ForkBranches};
pub use primitives::{Delay, Stop, SubWorkflow, Throw, ThrowIf};
pub use switch::{Switch, SwitchCases};
