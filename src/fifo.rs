//! FIFO marshaling
//!
//! Packet data moves through 32-bit push / pop registers. These functions pack
//! caller bytes into little-endian words, and unpack them again. None of them
//! block.

use crate::ral;

/// Number of FIFO words that hold `size` bytes
pub const fn words(size: usize) -> usize {
    (size + 3) / 4
}

/// Pop `dst.len()` bytes from the receive FIFO
///
/// Consumes exactly `words(dst.len())` words. The unused bytes of the final
/// word are discarded.
pub fn read_packet(fifo: &ral::otg::Fifo, dst: &mut [u8]) {
    let mut chunks = dst.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = ral::read_reg!(ral::otg, fifo, DFIFO);
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    let remainder = chunks.into_remainder();
    if !remainder.is_empty() {
        let word = ral::read_reg!(ral::otg, fifo, DFIFO).to_le_bytes();
        remainder.copy_from_slice(&word[..remainder.len()]);
    }
}

/// Discard `size` bytes from the receive FIFO
pub fn dump_packet(fifo: &ral::otg::Fifo, size: usize) {
    for _ in 0..words(size) {
        let _ = ral::read_reg!(ral::otg, fifo, DFIFO);
    }
}

/// Push as much of `src` as IN endpoint `ep`'s transmit FIFO can take
///
/// Returns the number of bytes written. Free space is reported in whole words,
/// so a partial write always stops on a word boundary, and the caller resumes
/// from there on the next FIFO-empty event.
pub fn write_packet(usb: &ral::otg::RegisterBlock, ep: usize, src: &[u8]) -> usize {
    let available = ral::read_reg!(ral::otg::inep, &usb.IN[ep], DTXFSTS, INEPTFSAV) as usize * 4;
    let len = src.len().min(available);
    let fifo = &usb.FIFO[ep];

    let mut chunks = src[..len].chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        ral::write_reg!(ral::otg, fifo, DFIFO, word);
    }
    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut word = [0; 4];
        word[..remainder.len()].copy_from_slice(remainder);
        let word = u32::from_le_bytes(word);
        ral::write_reg!(ral::otg, fifo, DFIFO, word);
    }
    len
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim;

    #[test]
    fn word_count() {
        assert_eq!(words(0), 0);
        assert_eq!(words(1), 1);
        assert_eq!(words(4), 1);
        assert_eq!(words(5), 2);
        assert_eq!(words(64), 16);
    }

    #[test]
    fn write_packs_little_endian() {
        let regs = sim::registers();
        sim::poke(&regs.IN[1].DTXFSTS, 16);

        let written = write_packet(regs, 1, &[0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(written, 5);
        assert_eq!(regs.FIFO[1].DFIFO.transmitted(), Some(0x44332211));
        assert_eq!(regs.FIFO[1].DFIFO.transmitted().map(|word| word & 0xFF), Some(0x55));
        assert_eq!(regs.FIFO[1].DFIFO.transmitted(), None);
    }

    #[test]
    fn write_clamps_to_free_space() {
        let regs = sim::registers();
        sim::poke(&regs.IN[2].DTXFSTS, 1);

        let written = write_packet(regs, 2, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(written, 4);
        assert_eq!(regs.FIFO[2].DFIFO.pending_tx(), 1);
    }

    #[test]
    fn write_into_full_fifo() {
        let regs = sim::registers();
        assert_eq!(write_packet(regs, 3, &[0xAA; 8]), 0);
        assert_eq!(regs.FIFO[3].DFIFO.pending_tx(), 0);
    }

    #[test]
    fn read_spills_remainder() {
        let regs = sim::registers();
        regs.FIFO[0].DFIFO.receive(0x44332211);
        regs.FIFO[0].DFIFO.receive(0xDDCCBB55);
        regs.FIFO[0].DFIFO.receive(0xFFFFFFFF);

        let mut dst = [0; 5];
        read_packet(&regs.FIFO[0], &mut dst);
        assert_eq!(dst, [0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(regs.FIFO[0].DFIFO.pending_rx(), 1);
    }

    #[test]
    fn dump_consumes_rounded_words() {
        let regs = sim::registers();
        for word in 0..3 {
            regs.FIFO[0].DFIFO.receive(word);
        }
        dump_packet(&regs.FIFO[0], 5);
        assert_eq!(regs.FIFO[0].DFIFO.pending_rx(), 1);
        dump_packet(&regs.FIFO[0], 0);
        assert_eq!(regs.FIFO[0].DFIFO.pending_rx(), 1);
    }
}
