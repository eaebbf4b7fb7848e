#![deny(missing_docs)]

//! Bounded dispatch queue and worker pool.
//!
//! Producers hand task references to a fixed-size FIFO, and a fixed set of long-lived worker
//! threads pops and processes them. A counting semaphore signals non-emptiness, an exclusive
//! lock guards mutation of the queue.

mod dispatch;
mod sync;

pub use self::{
    dispatch::{DispatchQueue, StartError, SubmitError, Task, WorkerPool},
    sync::Semaphore,
};
