//! Common building blocks shared by the `vnt` crates: fixed-interval polling and a bounded
//! worker pool returning joinable handles.

mod poll;
pub use poll::{PollError, Poller};

mod task;
pub use task::{Pending, WorkerPool};

/// Trims trailing whitespace and newlines from a command output, the way a remote shell result
/// is presented to callers.
#[inline]
pub fn trim_output(output: &str) -> String {
    output.trim_end().to_owned()
}
