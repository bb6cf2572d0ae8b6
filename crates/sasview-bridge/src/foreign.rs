//! Interpreter-heap values owned by the host for the duration of a query.

use crate::error::Result;
use crate::interpreter::{Interpreter, ObjectId};
use crate::runtime::QueryPhase;

/// A value living on the interpreter heap.
///
/// The interpreter does not see host-side references, so a `ForeignValue`
/// must be released explicitly. [`materialize`](ForeignValue::materialize)
/// copies the value out and releases it; dropping an unmaterialized value
/// releases it as well.
pub struct ForeignValue<'a> {
    interpreter: &'a mut dyn Interpreter,
    id: ObjectId,
    released: bool,
}

impl<'a> ForeignValue<'a> {
    /// Take ownership of a heap object returned by `eval`.
    pub fn new(interpreter: &'a mut dyn Interpreter, id: ObjectId) -> Self {
        Self {
            interpreter,
            id,
            released: false,
        }
    }

    /// Copy the value to the host, then release it.
    ///
    /// The release is attempted even when the transfer fails; in that case the
    /// transfer error is returned and a release failure is only logged.
    pub fn materialize(mut self) -> Result<Vec<u8>> {
        tracing::debug!(object = %self.id, "phase: {}", QueryPhase::Materializing);
        let transferred = self
            .interpreter
            .transfer(self.id)
            .map_err(|e| e.at(QueryPhase::Materializing));

        tracing::debug!(object = %self.id, "phase: {}", QueryPhase::Releasing);
        let released = self.release();

        match (transferred, released) {
            (Ok(bytes), Ok(())) => Ok(bytes),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                tracing::warn!(object = %self.id, "release after failed transfer also failed: {}", release_err);
                Err(e)
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        // A failed destroy is not retried: the handle may already be gone.
        self.released = true;
        self.interpreter
            .destroy(self.id)
            .map_err(|e| e.at(QueryPhase::Releasing))
    }
}

impl Drop for ForeignValue<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                tracing::warn!(object = %self.id, "failed to release dropped value: {}", e);
            }
        }
    }
}
