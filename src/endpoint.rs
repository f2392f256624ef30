//! Endpoint configuration records, register encodings, and FIFO bookkeeping

use crate::{Error, ENDPOINT_COUNT};
use usb_device::{endpoint::EndpointType, UsbDirection};

/// The smallest FIFO allocation, in 32-bit words
pub const MIN_FIFO_WORDS: u16 = 16;

/// A transmit FIFO's placement within FIFO RAM, in 32-bit words
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxFifo {
    /// Start of the FIFO
    pub offset: u16,
    /// Depth of the FIFO
    pub words: u16,
}

impl TxFifo {
    /// The FIFO's location in bytes
    pub fn byte_range(&self) -> core::ops::Range<usize> {
        let start = self.offset as usize * 4;
        start..start + self.words as usize * 4
    }
}

/// A configured endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub number: usize,
    pub direction: UsbDirection,
    pub kind: EndpointType,
    pub max_packet_size: u16,
    /// Transmit FIFO assignment, if this is a sized IN endpoint
    pub tx_fifo: Option<TxFifo>,
}

impl EndpointConfig {
    pub(crate) fn is_isochronous(&self) -> bool {
        matches!(self.kind, EndpointType::Isochronous { .. })
    }
}

/// Returns the number of packets that carry a transfer of `size` bytes
///
/// A zero-length transfer still sends, or expects, one packet.
///
/// # Panics
///
/// Panics if `max_packet_size` is zero.
pub const fn packet_count(size: usize, max_packet_size: u16) -> usize {
    let max_packet_size = max_packet_size as usize;
    if size == 0 {
        1
    } else {
        (size + max_packet_size - 1) / max_packet_size
    }
}

/// Endpoint 0's MPSIZ codes
fn ep0_mpsiz(max_packet_size: u16) -> Option<u32> {
    match max_packet_size {
        8 => Some(3),
        16 => Some(2),
        32 => Some(1),
        64 => Some(0),
        _ => None,
    }
}

/// Validate, and encode, the MPSIZ field for endpoint `ep`
pub(crate) fn mpsiz(ep: usize, kind: EndpointType, max_packet_size: u16) -> Result<u32, Error> {
    if ep == 0 {
        return ep0_mpsiz(max_packet_size)
            .filter(|_| kind == EndpointType::Control)
            .ok_or(Error::InvalidConfiguration);
    }
    let limit = match kind {
        EndpointType::Isochronous { .. } => 1023,
        _ => 64,
    };
    if max_packet_size == 0 || max_packet_size > limit {
        Err(Error::InvalidConfiguration)
    } else {
        Ok(max_packet_size as u32)
    }
}

/// The EPTYP encoding
pub(crate) fn eptyp(kind: EndpointType) -> u32 {
    match kind {
        EndpointType::Control => 0,
        EndpointType::Isochronous { .. } => 1,
        EndpointType::Bulk => 2,
        EndpointType::Interrupt => 3,
    }
}

/// The largest transfer that the transfer-size register can describe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TransferLimits {
    pub bytes: usize,
    pub packets: usize,
}

pub(crate) const fn in_limits(ep: usize) -> TransferLimits {
    if ep == 0 {
        TransferLimits {
            bytes: 0x7F,
            packets: 3,
        }
    } else {
        TransferLimits {
            bytes: 0x7_FFFF,
            packets: 0x3FF,
        }
    }
}

pub(crate) const fn out_limits(ep: usize) -> TransferLimits {
    if ep == 0 {
        TransferLimits {
            bytes: 0x7F,
            packets: 1,
        }
    } else {
        TransferLimits {
            bytes: 0x7_FFFF,
            packets: 0x3FF,
        }
    }
}

/// Carves the FIFO RAM into the receive FIFO and per-endpoint transmit FIFOs
///
/// The receive FIFO sits at the start of RAM. Each transmit FIFO follows the
/// receive FIFO and every lower-numbered transmit FIFO, so changing one
/// allocation moves all of the FIFOs above it.
pub(crate) struct FifoAllocator {
    capacity: u16,
    rx: u16,
    tx: [u16; ENDPOINT_COUNT],
}

impl FifoAllocator {
    pub const fn new(capacity: u16) -> Self {
        FifoAllocator {
            capacity,
            rx: 0,
            tx: [0; ENDPOINT_COUNT],
        }
    }

    fn fits(&self, rx: u16, tx: &[u16; ENDPOINT_COUNT]) -> bool {
        let used = rx as u32 + tx.iter().map(|&words| words as u32).sum::<u32>();
        used <= self.capacity as u32
    }

    /// Size the receive FIFO, returning the allocated words
    pub fn set_rx(&mut self, words: u16) -> Result<u16, Error> {
        let words = words.max(MIN_FIFO_WORDS);
        if !self.fits(words, &self.tx) {
            return Err(Error::FifoMemoryOverflow);
        }
        self.rx = words;
        Ok(words)
    }

    pub fn rx(&self) -> u16 {
        self.rx
    }

    /// Size IN endpoint `ep`'s transmit FIFO, returning the allocated words
    pub fn set_tx(&mut self, ep: usize, words: u16) -> Result<u16, Error> {
        let words = words.max(MIN_FIFO_WORDS);
        let mut tx = self.tx;
        tx[ep] = words;
        if !self.fits(self.rx, &tx) {
            return Err(Error::FifoMemoryOverflow);
        }
        self.tx = tx;
        Ok(words)
    }

    /// Returns IN endpoint `ep`'s transmit FIFO, if it's been sized
    pub fn tx(&self, ep: usize) -> Option<TxFifo> {
        let words = self.tx[ep];
        (words != 0).then(|| TxFifo {
            offset: self.rx + self.tx[..ep].iter().sum::<u16>(),
            words,
        })
    }

    /// Forget every allocation
    pub fn clear(&mut self) {
        self.rx = 0;
        self.tx = [0; ENDPOINT_COUNT];
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use usb_device::endpoint::{IsochronousSynchronizationType, IsochronousUsageType};

    const ISOCHRONOUS: EndpointType = EndpointType::Isochronous {
        synchronization: IsochronousSynchronizationType::Asynchronous,
        usage: IsochronousUsageType::Data,
    };

    #[test]
    fn packet_count_law() {
        assert_eq!(packet_count(0, 64), 1);
        assert_eq!(packet_count(0, 8), 1);
        assert_eq!(packet_count(1, 64), 1);
        assert_eq!(packet_count(64, 64), 1);
        assert_eq!(packet_count(65, 64), 2);
        assert_eq!(packet_count(128, 64), 2);
        for size in 1..600 {
            for mps in [8, 16, 32, 63, 64] {
                let expected = (size + mps as usize - 1) / mps as usize;
                assert_eq!(packet_count(size, mps), expected.max(1));
            }
        }
    }

    #[test]
    fn ep0_packet_size_codes() {
        assert_eq!(mpsiz(0, EndpointType::Control, 8), Ok(3));
        assert_eq!(mpsiz(0, EndpointType::Control, 16), Ok(2));
        assert_eq!(mpsiz(0, EndpointType::Control, 32), Ok(1));
        assert_eq!(mpsiz(0, EndpointType::Control, 64), Ok(0));
        assert_eq!(mpsiz(0, EndpointType::Control, 12), Err(Error::InvalidConfiguration));
        assert_eq!(mpsiz(0, EndpointType::Bulk, 64), Err(Error::InvalidConfiguration));
    }

    #[test]
    fn packet_size_limits() {
        assert_eq!(mpsiz(1, EndpointType::Bulk, 64), Ok(64));
        assert_eq!(mpsiz(1, EndpointType::Interrupt, 10), Ok(10));
        assert_eq!(mpsiz(2, EndpointType::Bulk, 65), Err(Error::InvalidConfiguration));
        assert_eq!(mpsiz(2, EndpointType::Bulk, 0), Err(Error::InvalidConfiguration));
        assert_eq!(mpsiz(3, ISOCHRONOUS, 1023), Ok(1023));
        assert_eq!(mpsiz(3, ISOCHRONOUS, 1024), Err(Error::InvalidConfiguration));
    }

    #[test]
    fn endpoint_types() {
        assert_eq!(eptyp(EndpointType::Control), 0);
        assert_eq!(eptyp(ISOCHRONOUS), 1);
        assert_eq!(eptyp(EndpointType::Bulk), 2);
        assert_eq!(eptyp(EndpointType::Interrupt), 3);
    }

    #[test]
    fn allocations_clamp_to_minimum() {
        let mut fifos = FifoAllocator::new(320);
        assert_eq!(fifos.set_rx(4), Ok(MIN_FIFO_WORDS));
        assert_eq!(fifos.set_tx(0, 0), Ok(MIN_FIFO_WORDS));
        assert_eq!(fifos.tx(0), Some(TxFifo { offset: 16, words: 16 }));
    }

    #[test]
    fn transmit_fifos_are_cumulative() {
        let mut fifos = FifoAllocator::new(320);
        fifos.set_rx(128).unwrap();
        fifos.set_tx(0, 16).unwrap();
        fifos.set_tx(1, 64).unwrap();
        fifos.set_tx(3, 32).unwrap();

        assert_eq!(fifos.tx(0), Some(TxFifo { offset: 128, words: 16 }));
        assert_eq!(fifos.tx(1), Some(TxFifo { offset: 144, words: 64 }));
        assert_eq!(fifos.tx(2), None);
        assert_eq!(fifos.tx(3), Some(TxFifo { offset: 208, words: 32 }));
        assert_eq!(fifos.tx(1).unwrap().byte_range(), 576..832);

        fifos.set_tx(0, 32).unwrap();
        assert_eq!(fifos.tx(1), Some(TxFifo { offset: 160, words: 64 }));
        assert_eq!(fifos.tx(3), Some(TxFifo { offset: 224, words: 32 }));
    }

    #[test]
    fn allocations_fit_fifo_ram() {
        let mut fifos = FifoAllocator::new(320);
        fifos.set_rx(128).unwrap();
        fifos.set_tx(0, 128).unwrap();
        assert_eq!(fifos.set_tx(1, 65), Err(Error::FifoMemoryOverflow));
        assert_eq!(fifos.tx(1), None);
        assert_eq!(fifos.set_tx(1, 64), Ok(64));
        assert_eq!(fifos.set_rx(129), Err(Error::FifoMemoryOverflow));
        assert_eq!(fifos.rx(), 128);

        fifos.clear();
        assert_eq!(fifos.rx(), 0);
        assert_eq!(fifos.tx(0), None);
    }
}
