//! The fatal-error hook.
//!
//! Every driver failure the engines cannot resolve is handed to the instance's [Escalation]
//! exactly once, before the failing call returns its error. What the hook does (log, halt,
//! schedule a replacement) is up to the application; the error is returned regardless.

use super::FlashInfo;
use crate::driver::DriverStatus;

use thiserror::Error;

/// Which driver operation failed
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Operation {
    Read,
    Write,
    Erase,
    EraseVerify,
}

/// A driver failure, with enough context to act on it
#[derive(Debug, Eq, PartialEq, Copy, Clone, Error)]
#[error("{operation:?} of block {block} failed: {status}")]
pub struct Fault {
    pub operation: Operation,
    pub block: u32,
    pub status: DriverStatus,
}

/// Receives unrecoverable driver failures
pub trait Escalation {
    fn escalate(&mut self, flash: &FlashInfo, fault: &Fault);
}

impl<F: FnMut(&FlashInfo, &Fault)> Escalation for F {
    fn escalate(&mut self, flash: &FlashInfo, fault: &Fault) {
        self(flash, fault)
    }
}

/// Default escalation: log and carry on returning the error
#[derive(Debug, Default, Copy, Clone)]
pub struct LogEscalation;

impl Escalation for LogEscalation {
    fn escalate(&mut self, flash: &FlashInfo, fault: &Fault) {
        log::error!("{}: {fault}", flash.name);
    }
}
