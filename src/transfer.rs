//! Transfer descriptors
//!
//! There's one descriptor per endpoint and direction. A blocking call arms it
//! with a borrowed buffer; the bus event handler moves it through the buffer
//! and resolves it; the blocking call takes the result, returning the
//! descriptor to idle.

use crate::Error;

/// The state of a transfer descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Status {
    /// Nothing is in flight; the descriptor may be armed
    Idle,
    /// A transfer is in flight
    Armed,
    /// The transfer finished, moving this many bytes
    Complete(usize),
    /// The transfer was aborted
    Failed(Error),
}

/// What an OUT descriptor accepts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Data,
    Setup,
}

pub struct Transfer {
    status: Status,
    kind: Kind,
    buffer: *mut u8,
    requested: usize,
    offset: usize,
    overflowed: bool,
}

impl Transfer {
    pub const fn new() -> Self {
        Transfer {
            status: Status::Idle,
            kind: Kind::Data,
            buffer: core::ptr::null_mut(),
            requested: 0,
            offset: 0,
            overflowed: false,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_armed(&self) -> bool {
        self.status == Status::Armed
    }

    /// Arm the descriptor to move `requested` bytes through `buffer`
    ///
    /// Fails with `Busy`, and changes nothing, unless the descriptor is idle.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `requested` bytes, and must not be accessed
    /// by anyone else, until the descriptor returns to idle. The handler only
    /// writes through the pointer for OUT descriptors.
    pub unsafe fn arm(&mut self, buffer: *mut u8, requested: usize, kind: Kind) -> Result<(), Error> {
        if self.status != Status::Idle {
            return Err(Error::Busy);
        }
        *self = Transfer {
            status: Status::Armed,
            kind,
            buffer,
            requested,
            offset: 0,
            overflowed: false,
        };
        Ok(())
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.requested - self.offset
    }

    /// Start again at the front of the buffer
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// Record that `count` more bytes moved
    pub fn advance(&mut self, count: usize) {
        self.offset = (self.offset + count).min(self.requested);
    }

    /// Record that the host sent more than the buffer holds
    pub fn overflow(&mut self) {
        self.overflowed = true;
    }

    /// The bytes that haven't yet been sent
    ///
    /// # Safety
    ///
    /// The descriptor must be armed.
    pub unsafe fn unsent(&self) -> &[u8] {
        core::slice::from_raw_parts(self.buffer.add(self.offset), self.remaining())
    }

    /// The space that hasn't yet been filled
    ///
    /// # Safety
    ///
    /// The descriptor must be armed, and armed through a mutable buffer.
    pub unsafe fn unfilled(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.buffer.add(self.offset), self.remaining())
    }

    /// Resolve an armed transfer with the bytes moved so far
    ///
    /// An overflowed transfer fails instead. Returns `false` if nothing was armed.
    pub fn complete(&mut self) -> bool {
        if !self.is_armed() {
            return false;
        }
        self.status = if self.overflowed {
            Status::Failed(Error::Overflow)
        } else {
            Status::Complete(self.offset)
        };
        true
    }

    /// Fail an armed transfer; returns `false` if nothing was armed
    pub fn fail(&mut self, error: Error) -> bool {
        if !self.is_armed() {
            return false;
        }
        self.status = Status::Failed(error);
        true
    }

    /// Take a resolved transfer's result, returning the descriptor to idle
    pub fn take(&mut self) -> Option<Result<usize, Error>> {
        let result = match self.status {
            Status::Idle | Status::Armed => return None,
            Status::Complete(count) => Ok(count),
            Status::Failed(error) => Err(error),
        };
        self.release();
        Some(result)
    }

    /// Drop whatever is in flight, and forget the buffer
    pub fn release(&mut self) {
        *self = Transfer::new();
    }
}
