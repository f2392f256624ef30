//! A USB device driver for DWC2 OTG full-speed cores
//!
//! `otgfs-usbd` drives the OTG_FS peripheral found on many Cortex-M
//! microcontrollers, using its internal full-speed PHY. It manages the core's
//! FIFO RAM, programs endpoints, and moves packets between caller buffers and
//! the core's FIFOs. A cooperative task services the bus events, while other
//! tasks block in transfer calls until their transfer resolves, times out, or
//! is cancelled.
//!
//! Enumeration, descriptors, and class behaviors are left to the layers above.
//! Those layers hear about bus resets, suspends, and the rest by registering a
//! [`Listener`].
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`], and a [`Scheduler`] that describes your task system. See
//! the [`Bus`] documentation for a complete example.

#![no_std]

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod bus;
mod driver;
mod endpoint;
mod event;
mod fifo;
mod ral;
mod scheduler;
mod transfer;

#[cfg(test)]
mod sim;
#[cfg(test)]
mod vcell;

pub use bus::Bus;
pub use driver::Config;
pub use endpoint::{packet_count, EndpointConfig, TxFifo};
pub use event::{BusEvent, Events, Listener};
pub use scheduler::Scheduler;
pub use transfer::Status;
pub use usb_device::{endpoint::EndpointType, UsbDirection};

/// Endpoints per direction, including endpoint 0
pub const ENDPOINT_COUNT: usize = ral::otg::ENDPOINTS;

/// Driver errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error {
    /// The endpoint already has a transfer in flight
    Busy,
    /// The transfer didn't finish in time, and was aborted
    Timeout,
    /// The calling task was cancelled, and the transfer aborted
    Cancelled,
    /// The host reset the bus during the transfer
    Reset,
    /// The endpoint, or the whole device, was disabled during the transfer
    Disabled,
    /// The host sent more data than the receive buffer holds
    Overflow,
    /// The hardware stopped responding, or the endpoint isn't usable
    Fatal,
    /// The endpoint number is out of range
    InvalidEndpoint,
    /// A configuration value is out of range
    InvalidConfiguration,
    /// The transfer is larger than the endpoint can describe
    TooLarge,
    /// The FIFO allocations don't fit in FIFO RAM
    FifoMemoryOverflow,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let message = match self {
            Error::Busy => "endpoint busy",
            Error::Timeout => "transfer timed out",
            Error::Cancelled => "transfer cancelled",
            Error::Reset => "bus reset",
            Error::Disabled => "endpoint disabled",
            Error::Overflow => "receive buffer overflow",
            Error::Fatal => "unrecoverable hardware error",
            Error::InvalidEndpoint => "invalid endpoint",
            Error::InvalidConfiguration => "invalid configuration",
            Error::TooLarge => "transfer too large",
            Error::FifoMemoryOverflow => "FIFO memory overflow",
        };
        f.write_str(message)
    }
}

/// A type that owns the OTG_FS register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the OTG_FS
/// register block. The pointer returned by [`otg`](Peripherals::otg) is
/// assumed to be valid, and will be cast to a register definition. No one
/// else may access those registers while the driver exists.
///
/// # Example
///
/// A safe implementation of `Peripherals` for a chip whose OTG_FS core sits at
/// `0x5000_0000`. Assume that `pac` is shorthand for a peripheral access crate
/// with a singleton for the core.
///
/// ```
/// # mod pac { pub struct OTG_FS(()); impl OTG_FS { pub const PTR: *const () = 0x5000_0000 as _; pub fn take() -> Option<Self> { Some(OTG_FS(())) } } }
/// use otgfs_usbd::Peripherals;
///
/// struct UsbPeripheral {
///     _otg: pac::OTG_FS,
/// }
///
/// unsafe impl Peripherals for UsbPeripheral {
///     fn otg(&self) -> *const () {
///         pac::OTG_FS::PTR
///     }
/// }
///
/// let peripheral = UsbPeripheral { _otg: pac::OTG_FS::take().unwrap() };
/// assert_eq!(peripheral.otg(), 0x5000_0000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the OTG_FS register block
    fn otg(&self) -> *const ();
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn error_messages() {
        extern crate std;
        use std::string::ToString;
        assert_eq!(Error::Timeout.to_string(), "transfer timed out");
        assert_eq!(Error::FifoMemoryOverflow.to_string(), "FIFO memory overflow");
    }
}
