//! Simulated register cells for the OTG core
//!
//! Plain memory can stand in for most registers. The cells here model the
//! registers whose reads or writes have side effects. A zeroed
//! [`RegisterBlock`](ral::otg::RegisterBlock) is a reset peripheral.

extern crate std;

use crate::ral;
use crate::vcell::VCell;
use crate::Peripherals;

/// Words held by each simulated queue
const DEPTH: usize = 128;

struct Queue {
    words: [VCell<u32>; DEPTH],
    head: VCell<usize>,
    len: VCell<usize>,
}

impl Queue {
    fn push(&self, word: u32) {
        let len = self.len.read();
        assert!(len < DEPTH, "simulated queue overflow");
        self.words[(self.head.read() + len) % DEPTH].write(word);
        self.len.write(len + 1);
    }
    fn pop(&self) -> Option<u32> {
        let len = self.len.read();
        if len == 0 {
            return None;
        }
        let head = self.head.read();
        self.head.write((head + 1) % DEPTH);
        self.len.write(len - 1);
        Some(self.words[head].read())
    }
}

/// A FIFO window; reads pop received words, writes push transmitted words
pub struct Fifo {
    rx: Queue,
    tx: Queue,
}

impl Fifo {
    pub fn read(&self) -> u32 {
        self.rx.pop().unwrap_or(0)
    }
    pub fn write(&self, word: u32) {
        self.tx.push(word);
    }
    /// Queue a word that the core received from the host
    pub fn receive(&self, word: u32) {
        self.rx.push(word);
    }
    /// Take the oldest word that the driver pushed
    pub fn transmitted(&self) -> Option<u32> {
        self.tx.pop()
    }
    pub fn pending_rx(&self) -> usize {
        self.rx.len.read()
    }
    pub fn pending_tx(&self) -> usize {
        self.tx.len.read()
    }
}

/// GRXSTSP; every read pops one status word
pub struct StatusPop {
    queue: Queue,
}

impl StatusPop {
    pub fn read(&self) -> u32 {
        self.queue.pop().unwrap_or(0)
    }
    pub fn push(&self, status: u32) {
        self.queue.push(status);
    }
}

/// GRSTCTL; reset and flush requests complete as soon as they're written,
/// unless the register is stuck
pub struct ResetControl {
    value: VCell<u32>,
    stuck: VCell<bool>,
}

impl ResetControl {
    const SELF_CLEARING: u32 = ral::otg::GRSTCTL::CSRST::mask
        | ral::otg::GRSTCTL::PSRST::mask
        | ral::otg::GRSTCTL::FCRST::mask
        | ral::otg::GRSTCTL::RXFFLSH::mask
        | ral::otg::GRSTCTL::TXFFLSH::mask;

    pub fn read(&self) -> u32 {
        let value = self.value.read();
        if self.stuck.read() {
            value
        } else {
            (value & !Self::SELF_CLEARING) | ral::otg::GRSTCTL::AHBIDL::mask
        }
    }
    pub fn write(&self, value: u32) {
        self.value.write(value);
    }
    /// Requests never complete, and the AHB never reports idle
    pub fn stick(&self) {
        self.stuck.write(true);
    }
}

/// A write-one-to-clear status register
pub struct Latched {
    value: VCell<u32>,
}

impl Latched {
    pub fn read(&self) -> u32 {
        self.value.read()
    }
    pub fn write(&self, clear: u32) {
        self.value.update(|value| value & !clear);
    }
    /// Raise status bits, as the core would
    pub fn set(&self, bits: u32) {
        self.value.update(|value| value | bits);
    }
}

// Tests serialize register access through the critical section.
unsafe impl Sync for Fifo {}
unsafe impl Sync for StatusPop {}
unsafe impl Sync for ResetControl {}
unsafe impl Sync for Latched {}

/// Allocate a zeroed register block that lives for the rest of the test
pub fn registers() -> &'static ral::otg::RegisterBlock {
    // Safety: every cell in the block is valid when zeroed.
    let block: std::boxed::Box<ral::otg::RegisterBlock> =
        std::boxed::Box::new(unsafe { core::mem::zeroed() });
    std::boxed::Box::leak(block)
}

/// Write a value into a register that the driver can only read
pub fn poke(register: &ral::RORegister<u32>, value: u32) {
    unsafe { (register as *const ral::RORegister<u32> as *mut u32).write_volatile(value) }
}

/// Queue a received packet and its status word, then raise RXFLVL
pub fn receive(regs: &ral::otg::RegisterBlock, ep: usize, pktsts: u32, data: &[u8]) {
    use ral::otg::GRXSTSP::{BCNT, PKTSTS};
    regs.GRXSTSP.push(
        ep as u32 | (data.len() as u32) << BCNT::offset | pktsts << PKTSTS::offset,
    );
    for chunk in data.chunks(4) {
        let mut word = [0; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        regs.FIFO[0].DFIFO.receive(u32::from_le_bytes(word));
    }
    regs.GINTSTS.set(ral::otg::GINTSTS::RXFLVL::mask);
}

/// Raise an IN endpoint interrupt, and the summary bits that route to it
pub fn raise_in(regs: &ral::otg::RegisterBlock, ep: usize, bits: u32) {
    regs.IN[ep].DIEPINT.set(bits);
    poke(&regs.DAINT, regs.DAINT.read() | 1 << ep);
    regs.GINTSTS.set(ral::otg::GINTSTS::IEPINT::mask);
}

/// Raise an OUT endpoint interrupt, and the summary bits that route to it
pub fn raise_out(regs: &ral::otg::RegisterBlock, ep: usize, bits: u32) {
    regs.OUT[ep].DOEPINT.set(bits);
    poke(&regs.DAINT, regs.DAINT.read() | 1 << (ep + 16));
    regs.GINTSTS.set(ral::otg::GINTSTS::OEPINT::mask);
}

/// Lower the summary bits, as the core would once the endpoint interrupts clear
pub fn settle(regs: &ral::otg::RegisterBlock) {
    poke(&regs.DAINT, 0);
    regs.GINTSTS.write(
        ral::otg::GINTSTS::RXFLVL::mask
            | ral::otg::GINTSTS::IEPINT::mask
            | ral::otg::GINTSTS::OEPINT::mask,
    );
}

/// Simulated peripheral ownership
pub struct Otg(pub &'static ral::otg::RegisterBlock);

unsafe impl Peripherals for Otg {
    fn otg(&self) -> *const () {
        self.0 as *const _ as _
    }
}
