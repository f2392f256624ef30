//! Register access layer for the OTG full-speed core
//!
//! `ral-registers` supplies the register cells and the `read_reg!`, `write_reg!`,
//! and `modify_reg!` macros. This module describes the register block and the
//! fields of each register in the shape that those macros expect.
//!
//! Registers with side effects on access (the write-one-to-clear interrupt
//! registers, the reset control register, the status pop register, and the
//! data FIFOs) use cell aliases. Tests swap those aliases for simulated cells.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg, RORegister, RWRegister};

#[cfg(not(test))]
mod cells {
    pub type Fifo = super::RWRegister<u32>;
    pub type StatusPop = super::RORegister<u32>;
    pub type ResetControl = super::RWRegister<u32>;
    pub type Latched = super::RWRegister<u32>;
}

#[cfg(test)]
use crate::sim as cells;

/// Declares RAL-compatible field modules, given each field's offset and width
macro_rules! fields {
    ($($register:ident { $($field:ident: $offset:literal, $width:literal;)* })*) => {
        $(
            pub mod $register {
                $(
                    pub mod $field {
                        pub const offset: u32 = $offset;
                        pub const mask: u32 = (u32::MAX >> (32 - $width)) << offset;
                        pub mod R {}
                        pub mod W {}
                        pub mod RW {}
                    }
                )*
            }
        )*
    };
}

pub mod otg {
    use super::cells::{Fifo as FifoCell, Latched, ResetControl, StatusPop};
    use super::{RORegister, RWRegister};

    /// Number of endpoints per direction that the register block describes
    pub const ENDPOINTS: usize = 8;

    /// OTG_FS global, device, and power registers, followed by the FIFO windows
    #[repr(C)]
    pub struct RegisterBlock {
        pub GOTGCTL: RWRegister<u32>,
        pub GOTGINT: Latched,
        pub GAHBCFG: RWRegister<u32>,
        pub GUSBCFG: RWRegister<u32>,
        pub GRSTCTL: ResetControl,
        pub GINTSTS: Latched,
        pub GINTMSK: RWRegister<u32>,
        pub GRXSTSR: RORegister<u32>,
        pub GRXSTSP: StatusPop,
        pub GRXFSIZ: RWRegister<u32>,
        pub DIEPTXF0: TxFifoSize,
        pub GNPTXSTS: RORegister<u32>,
        _reserved0: [u32; 2],
        pub GCCFG: RWRegister<u32>,
        pub CID: RWRegister<u32>,
        _reserved1: [u32; 48],
        pub HPTXFSIZ: RWRegister<u32>,
        /// Transmit FIFO sizes for IN endpoints 1 through 7
        pub DIEPTXF: [TxFifoSize; ENDPOINTS - 1],
        _reserved2: [u32; 440],
        pub DCFG: RWRegister<u32>,
        pub DCTL: RWRegister<u32>,
        pub DSTS: RORegister<u32>,
        _reserved3: [u32; 1],
        pub DIEPMSK: RWRegister<u32>,
        pub DOEPMSK: RWRegister<u32>,
        pub DAINT: RORegister<u32>,
        pub DAINTMSK: RWRegister<u32>,
        _reserved4: [u32; 2],
        pub DVBUSDIS: RWRegister<u32>,
        pub DVBUSPULSE: RWRegister<u32>,
        _reserved5: [u32; 1],
        pub DIEPEMPMSK: RWRegister<u32>,
        _reserved6: [u32; 50],
        pub IN: [inep::InEndpoint; ENDPOINTS],
        _reserved7: [u32; 64],
        pub OUT: [outep::OutEndpoint; ENDPOINTS],
        _reserved8: [u32; 128],
        pub PCGCCTL: RWRegister<u32>,
        _reserved9: [u32; 127],
        pub FIFO: [Fifo; ENDPOINTS],
    }

    /// Tests share one simulated block across threads; every access happens
    /// inside a critical section.
    #[cfg(test)]
    unsafe impl Sync for RegisterBlock {}

    /// A transmit FIFO start address and depth register
    ///
    /// Endpoint 0 uses `DIEPTXF0`; the rest use `DIEPTXF[n - 1]`. Both
    /// share one field layout.
    #[repr(transparent)]
    pub struct TxFifoSize {
        pub DIEPTXF: RWRegister<u32>,
    }

    /// The 4KiB push / pop window for one endpoint's FIFO
    ///
    /// Every window above the first pushes into that endpoint's transmit FIFO.
    /// The first window also pops from the shared receive FIFO.
    #[repr(C)]
    pub struct Fifo {
        pub DFIFO: FifoCell,
        _reserved: [u32; 1023],
    }

    impl RegisterBlock {
        /// Returns the transmit FIFO size register for IN endpoint `ep`
        pub fn tx_fifo_size(&self, ep: usize) -> &TxFifoSize {
            if ep == 0 {
                &self.DIEPTXF0
            } else {
                &self.DIEPTXF[ep - 1]
            }
        }
    }

    /// An owned pointer to the OTG register block
    pub struct Instance {
        block: *const RegisterBlock,
    }

    impl Instance {
        /// # Safety
        ///
        /// `block` must point to an OTG_FS register block that is not
        /// otherwise accessed for the lifetime of the instance.
        pub unsafe fn new(block: *const ()) -> Self {
            Instance {
                block: block.cast(),
            }
        }
    }

    impl core::ops::Deref for Instance {
        type Target = RegisterBlock;
        fn deref(&self) -> &RegisterBlock {
            // Safety: validity is an invariant of construction.
            unsafe { &*self.block }
        }
    }

    fields! {
        GOTGCTL {
            BVALOEN: 6, 1;
            BVALOVAL: 7, 1;
        }
        GAHBCFG {
            GINT: 0, 1;
            TXFELVL: 7, 1;
            PTXFELVL: 8, 1;
        }
        GUSBCFG {
            TOCAL: 0, 3;
            PHYSEL: 6, 1;
            SRPCAP: 8, 1;
            HNPCAP: 9, 1;
            TRDT: 10, 4;
            FHMOD: 29, 1;
            FDMOD: 30, 1;
        }
        GRSTCTL {
            CSRST: 0, 1;
            PSRST: 1, 1;
            FCRST: 2, 1;
            RXFFLSH: 4, 1;
            TXFFLSH: 5, 1;
            TXFNUM: 6, 5;
            AHBIDL: 31, 1;
        }
        GINTSTS {
            CMOD: 0, 1;
            MMIS: 1, 1;
            OTGINT: 2, 1;
            SOF: 3, 1;
            RXFLVL: 4, 1;
            NPTXFE: 5, 1;
            GINAKEFF: 6, 1;
            GONAKEFF: 7, 1;
            ESUSP: 10, 1;
            USBSUSP: 11, 1;
            USBRST: 12, 1;
            ENUMDNE: 13, 1;
            ISOODRP: 14, 1;
            EOPF: 15, 1;
            IEPINT: 18, 1;
            OEPINT: 19, 1;
            IISOIXFR: 20, 1;
            INCOMPISOOUT: 21, 1;
            SRQINT: 30, 1;
            WKUPINT: 31, 1;
        }
        GRXSTSP {
            EPNUM: 0, 4;
            BCNT: 4, 11;
            DPID: 15, 2;
            PKTSTS: 17, 4;
            FRMNUM: 21, 4;
        }
        GRXFSIZ {
            RXFD: 0, 16;
        }
        DIEPTXF {
            INEPTXSA: 0, 16;
            INEPTXFD: 16, 16;
        }
        GCCFG {
            PWRDWN: 16, 1;
            VBUSASEN: 18, 1;
            VBUSBSEN: 19, 1;
            SOFOUTEN: 20, 1;
            NOVBUSSENS: 21, 1;
        }
        DCFG {
            DSPD: 0, 2;
            NZLSOHSK: 2, 1;
            DAD: 4, 7;
            PFIVL: 11, 2;
        }
        DCTL {
            RWUSIG: 0, 1;
            SDIS: 1, 1;
            GINSTS: 2, 1;
            GONSTS: 3, 1;
            SGINAK: 7, 1;
            CGINAK: 8, 1;
            SGONAK: 9, 1;
            CGONAK: 10, 1;
            POPRGDNE: 11, 1;
        }
        DSTS {
            SUSPSTS: 0, 1;
            ENUMSPD: 1, 2;
            EERR: 3, 1;
            FNSOF: 8, 14;
        }
        DIEPMSK {
            XFRCM: 0, 1;
            EPDM: 1, 1;
            TOM: 3, 1;
            ITTXFEMSK: 4, 1;
            INEPNMM: 5, 1;
            INEPNEM: 6, 1;
        }
        DOEPMSK {
            XFRCM: 0, 1;
            EPDM: 1, 1;
            STUPM: 3, 1;
            OTEPDM: 4, 1;
        }
        DAINT {
            IEPINT: 0, 16;
            OEPINT: 16, 16;
        }
        DIEPEMPMSK {
            INEPTXFEM: 0, 16;
        }
        PCGCCTL {
            STPPCLK: 0, 1;
            GATEHCLK: 1, 1;
            PHYSUSP: 4, 1;
        }
    }

    pub mod GINTMSK {
        pub use super::GINTSTS::*;
    }

    pub mod DAINTMSK {
        pub use super::DAINT::*;
    }

    /// IN endpoint register banks
    pub mod inep {
        use super::super::cells::Latched;
        use super::super::{RORegister, RWRegister};

        #[repr(C)]
        pub struct InEndpoint {
            pub DIEPCTL: RWRegister<u32>,
            _reserved0: u32,
            pub DIEPINT: Latched,
            _reserved1: u32,
            pub DIEPTSIZ: RWRegister<u32>,
            _reserved2: u32,
            pub DTXFSTS: RORegister<u32>,
            _reserved3: u32,
        }

        fields! {
            DIEPCTL {
                MPSIZ: 0, 11;
                USBAEP: 15, 1;
                EONUM_DPID: 16, 1;
                NAKSTS: 17, 1;
                EPTYP: 18, 2;
                STALL: 21, 1;
                TXFNUM: 22, 4;
                CNAK: 26, 1;
                SNAK: 27, 1;
                SD0PID_SEVNFRM: 28, 1;
                SODDFRM: 29, 1;
                EPDIS: 30, 1;
                EPENA: 31, 1;
            }
            DIEPINT {
                XFRC: 0, 1;
                EPDISD: 1, 1;
                TOC: 3, 1;
                ITTXFE: 4, 1;
                INEPNE: 6, 1;
                TXFE: 7, 1;
            }
            DIEPTSIZ {
                XFRSIZ: 0, 19;
                PKTCNT: 19, 10;
                MCNT: 29, 2;
            }
            DTXFSTS {
                INEPTFSAV: 0, 16;
            }
        }

        #[cfg(not(test))]
        const _: [(); 1] = [(); (core::mem::size_of::<InEndpoint>() == 0x20) as usize];
    }

    /// OUT endpoint register banks
    pub mod outep {
        use super::super::cells::Latched;
        use super::super::RWRegister;

        #[repr(C)]
        pub struct OutEndpoint {
            pub DOEPCTL: RWRegister<u32>,
            _reserved0: u32,
            pub DOEPINT: Latched,
            _reserved1: u32,
            pub DOEPTSIZ: RWRegister<u32>,
            _reserved2: [u32; 3],
        }

        fields! {
            DOEPCTL {
                MPSIZ: 0, 11;
                USBAEP: 15, 1;
                EONUM_DPID: 16, 1;
                NAKSTS: 17, 1;
                EPTYP: 18, 2;
                SNPM: 20, 1;
                STALL: 21, 1;
                CNAK: 26, 1;
                SNAK: 27, 1;
                SD0PID_SEVNFRM: 28, 1;
                SODDFRM: 29, 1;
                EPDIS: 30, 1;
                EPENA: 31, 1;
            }
            DOEPINT {
                XFRC: 0, 1;
                EPDISD: 1, 1;
                STUP: 3, 1;
                OTEPDIS: 4, 1;
                B2BSTUP: 6, 1;
            }
            DOEPTSIZ {
                XFRSIZ: 0, 19;
                PKTCNT: 19, 10;
                STUPCNT: 29, 2;
            }
        }

        #[cfg(not(test))]
        const _: [(); 1] = [(); (core::mem::size_of::<OutEndpoint>() == 0x20) as usize];
    }

    #[cfg(not(test))]
    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x9000) as usize];
}
