//! Continuation records: reified suspended frames.
//!
//! When a call suspends, each frame on the way out snapshots its live state
//! into a `Continuation` and pushes it onto the suspension's chain. The
//! chain head is the outermost frame; `caller` links walk inward to the
//! frame closest to the suspension primitive. Resuming runs the chain from
//! the inside out, feeding each function's return value to the next record.

use serde::{Deserialize, Serialize};

use crate::{
    native::SuspendCause,
    value::Value,
};

/// Names the function a continuation record re-enters: the resume handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeTarget {
    /// A program function, by index.
    Script(u32),
    /// A class method.
    Method { class: std::rc::Rc<str>, index: u32 },
    /// A native step machine; `method_location` is the step to re-enter.
    Native(u32),
}

/// One suspended frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuation {
    /// The record of the function this frame was calling when it
    /// suspended; `None` for the innermost record.
    pub caller: Option<Box<Continuation>>,
    /// Which function's resume dispatch re-enters this frame.
    pub target: ResumeTarget,
    /// Dense suspension-point id within the function (or native step).
    pub method_location: u32,
    /// Primitive-bank snapshot: bool/int/long/double locals, i64-encoded.
    pub local_primitives: Vec<i64>,
    /// Object-bank snapshot: reference locals and cells, then the
    /// synthesised operand-stack slots live across the call.
    pub local_objects: Vec<Value>,
    /// The suspended call's result, filled in just before re-entry.
    pub result: Value,
}

impl Continuation {
    #[must_use]
    pub fn new(
        target: ResumeTarget,
        method_location: u32,
        local_primitives: Vec<i64>,
        local_objects: Vec<Value>,
    ) -> Self {
        Self {
            caller: None,
            target,
            method_location,
            local_primitives,
            local_objects,
            result: Value::Null,
        }
    }

    /// Flattens the chain into resume order: innermost record first.
    #[must_use]
    pub fn into_resume_order(self) -> Vec<Self> {
        let mut records = Vec::new();
        let mut current = Some(Box::new(self));
        while let Some(mut record) = current {
            current = record.caller.take();
            records.push(*record);
        }
        // collected outermost-first; resume wants innermost-first
        records.reverse();
        records
    }

    /// Rebuilds a chain (head = outermost) from resume-ordered records.
    #[must_use]
    pub fn from_resume_order(mut records: Vec<Self>) -> Option<Self> {
        let mut chain: Option<Box<Self>> = None;
        // innermost-first: each record's caller is the chain built so far
        records.iter_mut().for_each(|r| r.caller = None);
        for mut record in records {
            record.caller = chain;
            chain = Some(Box::new(record));
        }
        chain.map(|c| *c)
    }
}

/// A suspension travelling up the stack: why execution stopped plus the
/// chain of frames to re-enter. The chain grows as the unwind passes each
/// frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct Suspension {
    pub cause: SuspendCause,
    pub chain: Option<Box<Continuation>>,
}

impl Suspension {
    #[must_use]
    pub fn new(cause: SuspendCause) -> Self {
        Self { cause, chain: None }
    }

    /// Pushes the next (outer) frame's record; it becomes the chain head.
    pub fn push_frame(&mut self, mut record: Continuation) {
        record.caller = self.chain.take();
        self.chain = Some(Box::new(record));
    }

    /// Serialises the chain for checkpointing.
    pub fn checkpoint_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(&self.chain)
    }

    /// Restores a chain from checkpoint bytes.
    pub fn restore_chain(bytes: &[u8]) -> Result<Option<Box<Continuation>>, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(loc: u32) -> Continuation {
        Continuation::new(ResumeTarget::Script(0), loc, vec![loc as i64], vec![])
    }

    #[test]
    fn chain_resumes_inside_out() {
        let mut susp = Suspension::new(SuspendCause::Checkpoint);
        susp.push_frame(record(0)); // innermost frame unwinds first
        susp.push_frame(record(1));
        susp.push_frame(record(2)); // outermost
        let chain = *susp.chain.unwrap();
        assert_eq!(chain.method_location, 2);
        let order: Vec<u32> = chain
            .into_resume_order()
            .into_iter()
            .map(|c| c.method_location)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn resume_order_round_trips() {
        let mut susp = Suspension::new(SuspendCause::Checkpoint);
        susp.push_frame(record(0));
        susp.push_frame(record(1));
        let chain = *susp.chain.unwrap();
        let records = chain.into_resume_order();
        let rebuilt = Continuation::from_resume_order(records).unwrap();
        assert_eq!(rebuilt.method_location, 1);
        assert_eq!(rebuilt.caller.as_ref().unwrap().method_location, 0);
    }

    #[test]
    fn checkpoint_bytes_round_trip() {
        let mut susp = Suspension::new(SuspendCause::Checkpoint);
        susp.push_frame(record(0));
        susp.push_frame(record(7));
        let bytes = susp.checkpoint_bytes().unwrap();
        let chain = Suspension::restore_chain(&bytes).unwrap().unwrap();
        assert_eq!(chain.method_location, 7);
        assert_eq!(chain.caller.as_ref().unwrap().local_primitives, vec![0]);
    }
}
