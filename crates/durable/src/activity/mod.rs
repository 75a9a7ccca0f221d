//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the retry policy
//! - Run under a start-to-close timeout enforced by the [`ActivityInvoker`]
//! - Support cooperative cancellation via tokens

mod context;
mod definition;
mod invoker;
mod registry;
mod task;

pub use context::{ActivityContext, HeartbeatError};
pub use definition::{Activity, ActivityError};
pub use invoker::ActivityInvoker;
pub use registry::{ActivityRegistry, AnyActivity};
pub use task::ActivityTask;
