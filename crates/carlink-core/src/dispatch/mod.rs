//! Callback dispatch.
//!
//! # Sub-modules
//!
//! - **`executor`**  – The [`executor::Executor`] abstraction ("where to run a
//!   callback") and [`executor::SerialExecutor`], which runs jobs one at a time
//!   in submission order on a dedicated thread or a Tokio task.
//!
//! - **`callbacks`** – [`callbacks::ThreadSafeCallbacks`], a multi-subscriber
//!   registry whose `invoke` snapshots the current subscribers and dispatches
//!   to each one on its own executor.

pub mod callbacks;
pub mod executor;
