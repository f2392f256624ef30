//! The OTG full-speed device controller
//!
//! `Controller` owns the register block, the endpoint records, the FIFO
//! allocations, and a transfer descriptor per endpoint and direction. It never
//! blocks. [`Bus`](crate::Bus) wraps it for shared access, and builds the
//! blocking transfer calls on top of it.

use crate::{
    endpoint::{self, packet_count, EndpointConfig, FifoAllocator},
    event::Events,
    fifo, ral,
    transfer::{Kind, Status, Transfer},
    Error, Peripherals, ENDPOINT_COUNT,
};
use usb_device::{endpoint::EndpointType, UsbDirection};

/// Driver configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Size of the core's FIFO RAM, in 32-bit words
    pub fifo_ram_words: u16,
    /// Detect the host with the VBUS pin
    ///
    /// When `false`, the core assumes that VBUS is always valid.
    pub vbus_sensing: bool,
    /// USB turnaround time, in PHY clocks
    ///
    /// The right value depends on the AHB clock. 6 suits AHB clocks of 32MHz
    /// and faster.
    pub turnaround_time: u8,
    /// Number of polls before a wait on the hardware gives up
    pub spin_limit: u32,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            fifo_ram_words: 320,
            vbus_sensing: false,
            turnaround_time: 6,
            spin_limit: 100_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

bitflags::bitflags! {
    /// GINTSTS bits that the event handler services
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Interrupts : u32 {
        const RX_FIFO_LEVEL = ral::otg::GINTSTS::RXFLVL::mask;
        const USB_SUSPEND = ral::otg::GINTSTS::USBSUSP::mask;
        const USB_RESET = ral::otg::GINTSTS::USBRST::mask;
        const ENUMERATION_DONE = ral::otg::GINTSTS::ENUMDNE::mask;
        const IN_ENDPOINT = ral::otg::GINTSTS::IEPINT::mask;
        const OUT_ENDPOINT = ral::otg::GINTSTS::OEPINT::mask;
        const INCOMPLETE_ISO_IN = ral::otg::GINTSTS::IISOIXFR::mask;
        const INCOMPLETE_ISO_OUT = ral::otg::GINTSTS::INCOMPISOOUT::mask;
        const WAKEUP = ral::otg::GINTSTS::WKUPINT::mask;

        /// Write-one-to-clear bits; the rest reflect other status
        const LATCHED = Self::USB_SUSPEND.bits()
            | Self::USB_RESET.bits()
            | Self::ENUMERATION_DONE.bits()
            | Self::INCOMPLETE_ISO_IN.bits()
            | Self::INCOMPLETE_ISO_OUT.bits()
            | Self::WAKEUP.bits();
    }
}

/// GRXSTSP packet status codes
pub(crate) mod packet_status {
    pub const GLOBAL_OUT_NAK: u32 = 1;
    pub const OUT_DATA: u32 = 2;
    pub const OUT_COMPLETE: u32 = 3;
    pub const SETUP_COMPLETE: u32 = 4;
    pub const SETUP_DATA: u32 = 6;
}

/// A popped receive status word
#[derive(Clone, Copy)]
struct RxStatus(u32);

impl RxStatus {
    fn field(self, mask: u32, offset: u32) -> u32 {
        (self.0 & mask) >> offset
    }
    fn endpoint(self) -> usize {
        use ral::otg::GRXSTSP::EPNUM;
        self.field(EPNUM::mask, EPNUM::offset) as usize
    }
    fn byte_count(self) -> usize {
        use ral::otg::GRXSTSP::BCNT;
        self.field(BCNT::mask, BCNT::offset) as usize
    }
    fn packet_status(self) -> u32 {
        use ral::otg::GRXSTSP::PKTSTS;
        self.field(PKTSTS::mask, PKTSTS::offset)
    }
}

/// TXFNUM value that selects every transmit FIFO
const ALL_TX_FIFOS: u32 = 0x10;

/// Bytes in a SETUP packet
pub(crate) const SETUP_PACKET_SIZE: usize = 8;

/// DSTS.ENUMSPD for a full-speed PHY
const FULL_SPEED: u32 = 3;

/// Poll `done` until it returns `true`, giving up after `limit` polls
fn spin(limit: u32, mut done: impl FnMut() -> bool) -> Result<(), Error> {
    for _ in 0..limit {
        if done() {
            return Ok(());
        }
    }
    Err(Error::Fatal)
}

fn check_endpoint(ep: usize) -> Result<(), Error> {
    if ep < ENDPOINT_COUNT {
        Ok(())
    } else {
        Err(Error::InvalidEndpoint)
    }
}

/// DAINTMSK bits for endpoint 0, and every configured endpoint
fn endpoint_mask(endpoints: &[Option<EndpointConfig>; ENDPOINT_COUNT]) -> u32 {
    endpoints
        .iter()
        .enumerate()
        .filter(|(_, config)| config.is_some())
        .fold(1, |mask, (ep, _)| mask | 1 << ep)
}

/// Even (`true`) or odd frame for the next isochronous transfer
fn even_frame(frame_number: u32) -> bool {
    frame_number & 1 == 1
}

/// A DWC2 OTG full-speed core in device mode
pub struct Controller {
    usb: ral::otg::Instance,
    config: Config,
    fifos: FifoAllocator,
    in_endpoints: [Option<EndpointConfig>; ENDPOINT_COUNT],
    out_endpoints: [Option<EndpointConfig>; ENDPOINT_COUNT],
    in_transfers: [Transfer; ENDPOINT_COUNT],
    out_transfers: [Transfer; ENDPOINT_COUNT],
    /// Endpoints the driver stopped on its own, whose EPDISD hasn't arrived
    in_stopping: [bool; ENDPOINT_COUNT],
    out_stopping: [bool; ENDPOINT_COUNT],
    active: bool,
}

/// What one pass of the event handler saw
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Serviced {
    /// Bus events observed during the pass
    pub events: Events,
    /// A hardware failure hit while servicing those events
    pub error: Option<Error>,
}

/// The raw pointers in the register instance and the descriptors are only
/// dereferenced by the owner of the `Controller`.
unsafe impl Send for Controller {}

const IDLE: Transfer = Transfer::new();

impl Controller {
    /// Create a controller that owns the peripheral's registers
    ///
    /// Call [`initialize`](Controller::initialize) before anything else.
    pub fn new<P: Peripherals>(peripherals: P, config: Config) -> Self {
        // Safety: Peripherals implementers promise ownership of the register block.
        let usb = unsafe { ral::otg::Instance::new(peripherals.otg()) };
        Controller {
            usb,
            config,
            fifos: FifoAllocator::new(config.fifo_ram_words),
            in_endpoints: [None; ENDPOINT_COUNT],
            out_endpoints: [None; ENDPOINT_COUNT],
            in_transfers: [IDLE; ENDPOINT_COUNT],
            out_transfers: [IDLE; ENDPOINT_COUNT],
            in_stopping: [false; ENDPOINT_COUNT],
            out_stopping: [false; ENDPOINT_COUNT],
            active: false,
        }
    }

    /// Bring up the core in device mode
    ///
    /// The device stays disconnected from the bus until [`connect`](Controller::connect).
    /// Fails with `Fatal` if the core never finishes a reset or flush.
    pub fn initialize(&mut self) -> Result<(), Error> {
        ral::modify_reg!(ral::otg, self.usb, GAHBCFG, GINT: 0);
        ral::modify_reg!(ral::otg, self.usb, GUSBCFG, PHYSEL: 1);

        self.core_reset()?;

        let turnaround = self.config.turnaround_time as u32;
        ral::modify_reg!(ral::otg, self.usb, GUSBCFG, FHMOD: 0, FDMOD: 1, SRPCAP: 0, HNPCAP: 0, TRDT: turnaround);
        spin(self.config.spin_limit, || {
            ral::read_reg!(ral::otg, self.usb, GINTSTS, CMOD == 0)
        })?;

        let vbus = self.config.vbus_sensing as u32;
        ral::modify_reg!(ral::otg, self.usb, GCCFG, PWRDWN: 1, VBUSASEN: 0, VBUSBSEN: vbus, NOVBUSSENS: vbus ^ 1);
        ral::write_reg!(ral::otg, self.usb, PCGCCTL, 0);
        ral::modify_reg!(ral::otg, self.usb, DCFG, DSPD: FULL_SPEED, PFIVL: 0, DAD: 0);
        ral::modify_reg!(ral::otg, self.usb, DCTL, SDIS: 1);

        self.flush_tx_fifo(ALL_TX_FIFOS)?;
        self.flush_rx_fifo()?;

        for ep in 0..ENDPOINT_COUNT {
            let bank = &self.usb.IN[ep];
            if ral::read_reg!(ral::otg::inep, bank, DIEPCTL, EPENA == 1) {
                ral::write_reg!(ral::otg::inep, bank, DIEPCTL, EPDIS: 1, SNAK: 1);
            } else {
                ral::write_reg!(ral::otg::inep, bank, DIEPCTL, 0);
            }
            ral::write_reg!(ral::otg::inep, bank, DIEPTSIZ, 0);
            ral::write_reg!(ral::otg::inep, bank, DIEPINT, 0xFF);

            let bank = &self.usb.OUT[ep];
            if ral::read_reg!(ral::otg::outep, bank, DOEPCTL, EPENA == 1) {
                ral::write_reg!(ral::otg::outep, bank, DOEPCTL, EPDIS: 1, SNAK: 1);
            } else {
                ral::write_reg!(ral::otg::outep, bank, DOEPCTL, 0);
            }
            ral::write_reg!(ral::otg::outep, bank, DOEPTSIZ, 0);
            ral::write_reg!(ral::otg::outep, bank, DOEPINT, 0xFF);
        }

        self.fifos.clear();
        self.in_endpoints = [None; ENDPOINT_COUNT];
        self.out_endpoints = [None; ENDPOINT_COUNT];
        for transfer in self.in_transfers.iter_mut().chain(self.out_transfers.iter_mut()) {
            transfer.release();
        }
        self.in_stopping = [false; ENDPOINT_COUNT];
        self.out_stopping = [false; ENDPOINT_COUNT];
        self.active = false;

        ral::write_reg!(ral::otg, self.usb, GINTSTS, 0xFFFF_FFFF);
        ral::write_reg!(ral::otg, self.usb, GINTMSK,
            USBRST: 1, ENUMDNE: 1, RXFLVL: 1, IEPINT: 1, OEPINT: 1,
            IISOIXFR: 1, INCOMPISOOUT: 1, USBSUSP: 1, WKUPINT: 1
        );
        self.baseline_masks();
        ral::write_reg!(ral::otg, self.usb, GAHBCFG, GINT: 1, TXFELVL: 1);

        debug!("INITIALIZED");
        Ok(())
    }

    fn core_reset(&self) -> Result<(), Error> {
        let limit = self.config.spin_limit;
        spin(limit, || ral::read_reg!(ral::otg, self.usb, GRSTCTL, AHBIDL == 1))?;
        ral::modify_reg!(ral::otg, self.usb, GRSTCTL, CSRST: 1);
        spin(limit, || ral::read_reg!(ral::otg, self.usb, GRSTCTL, CSRST == 0))
    }

    fn flush_tx_fifo(&self, fifo: u32) -> Result<(), Error> {
        ral::write_reg!(ral::otg, self.usb, GRSTCTL, TXFFLSH: 1, TXFNUM: fifo);
        spin(self.config.spin_limit, || {
            ral::read_reg!(ral::otg, self.usb, GRSTCTL, TXFFLSH == 0)
        })
    }

    fn flush_rx_fifo(&self) -> Result<(), Error> {
        ral::write_reg!(ral::otg, self.usb, GRSTCTL, RXFFLSH: 1);
        spin(self.config.spin_limit, || {
            ral::read_reg!(ral::otg, self.usb, GRSTCTL, RXFFLSH == 0)
        })
    }

    /// Endpoint interrupt masks for a freshly reset bus
    fn baseline_masks(&self) {
        ral::write_reg!(ral::otg, self.usb, DIEPMSK, XFRCM: 1, EPDM: 1, TOM: 1);
        ral::write_reg!(ral::otg, self.usb, DOEPMSK, XFRCM: 1, EPDM: 1, STUPM: 1);
        let in_mask = endpoint_mask(&self.in_endpoints);
        let out_mask = endpoint_mask(&self.out_endpoints);
        ral::write_reg!(ral::otg, self.usb, DAINTMSK, IEPINT: in_mask, OEPINT: out_mask);
        ral::write_reg!(ral::otg, self.usb, DIEPEMPMSK, 0);
    }

    /// Enable the pull-up, so the host sees the device
    pub fn connect(&mut self) {
        ral::modify_reg!(ral::otg, self.usb, PCGCCTL, STPPCLK: 0, GATEHCLK: 0);
        ral::modify_reg!(ral::otg, self.usb, GAHBCFG, GINT: 1);
        ral::modify_reg!(ral::otg, self.usb, DCTL, SDIS: 0);
        debug!("CONNECT");
    }

    /// Disable the pull-up, and stop servicing bus events
    ///
    /// In-flight transfers fail with `Disabled`.
    pub fn disconnect(&mut self) {
        ral::modify_reg!(ral::otg, self.usb, DCTL, SDIS: 1);
        ral::modify_reg!(ral::otg, self.usb, GAHBCFG, GINT: 0);
        ral::modify_reg!(ral::otg, self.usb, PCGCCTL, STPPCLK: 1, GATEHCLK: 1);
        self.active = false;
        self.fail_armed(Error::Disabled);
        debug!("DISCONNECT");
    }

    fn fail_armed(&mut self, error: Error) {
        for transfer in self.in_transfers.iter_mut().chain(self.out_transfers.iter_mut()) {
            transfer.fail(error);
        }
    }

    /// Returns `true` if the bus is active
    ///
    /// The bus is inactive before the first reset, while suspended, and after
    /// a disconnect.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The frame number of the last SOF
    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(ral::otg, self.usb, DSTS, FNSOF) as u16
    }

    /// Size the shared receive FIFO, returning the allocated words
    pub fn set_rx_fifo_size(&mut self, words: u16) -> Result<u16, Error> {
        let words = self.fifos.set_rx(words)?;
        ral::write_reg!(ral::otg, self.usb, GRXFSIZ, RXFD: words as u32);
        self.program_tx_fifos();
        Ok(words)
    }

    /// Size IN endpoint `ep`'s transmit FIFO, returning the allocated words
    pub fn set_tx_fifo_size(&mut self, ep: usize, words: u16) -> Result<u16, Error> {
        check_endpoint(ep)?;
        let words = self.fifos.set_tx(ep, words)?;
        self.program_tx_fifos();
        Ok(words)
    }

    fn program_tx_fifos(&mut self) {
        for ep in 0..ENDPOINT_COUNT {
            let tx_fifo = self.fifos.tx(ep);
            if let Some(tx) = tx_fifo {
                ral::write_reg!(ral::otg, self.usb.tx_fifo_size(ep), DIEPTXF,
                    INEPTXSA: tx.offset as u32, INEPTXFD: tx.words as u32);
            }
            if let Some(config) = self.in_endpoints[ep].as_mut() {
                config.tx_fifo = tx_fifo;
            }
        }
    }

    /// Returns IN endpoint `ep`'s configuration
    pub fn in_endpoint(&self, ep: usize) -> Option<EndpointConfig> {
        self.in_endpoints.get(ep).copied().flatten()
    }

    /// Returns OUT endpoint `ep`'s configuration
    pub fn out_endpoint(&self, ep: usize) -> Option<EndpointConfig> {
        self.out_endpoints.get(ep).copied().flatten()
    }

    /// Activate IN endpoint `ep`
    pub fn configure_in_endpoint(
        &mut self,
        ep: usize,
        kind: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), Error> {
        check_endpoint(ep)?;
        if self.in_transfers[ep].is_armed() {
            return Err(Error::Busy);
        }
        let mpsiz = endpoint::mpsiz(ep, kind, max_packet_size)?;
        let eptyp = endpoint::eptyp(kind);

        ral::write_reg!(ral::otg::inep, &self.usb.IN[ep], DIEPCTL,
            MPSIZ: mpsiz, EPTYP: eptyp, TXFNUM: ep as u32, SD0PID_SEVNFRM: 1, USBAEP: 1, SNAK: 1);
        ral::modify_reg!(ral::otg, self.usb, DAINTMSK, |mask| mask | 1 << ep);

        self.in_endpoints[ep] = Some(EndpointConfig {
            number: ep,
            direction: UsbDirection::In,
            kind,
            max_packet_size,
            tx_fifo: self.fifos.tx(ep),
        });
        debug!("EP{} IN {:?} MPS {}", ep, kind, max_packet_size);
        Ok(())
    }

    /// Activate OUT endpoint `ep`
    pub fn configure_out_endpoint(
        &mut self,
        ep: usize,
        kind: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), Error> {
        check_endpoint(ep)?;
        if self.out_transfers[ep].is_armed() {
            return Err(Error::Busy);
        }
        let mpsiz = endpoint::mpsiz(ep, kind, max_packet_size)?;
        let eptyp = endpoint::eptyp(kind);

        ral::write_reg!(ral::otg::outep, &self.usb.OUT[ep], DOEPCTL,
            MPSIZ: mpsiz, EPTYP: eptyp, SD0PID_SEVNFRM: 1, USBAEP: 1, SNAK: 1);
        ral::modify_reg!(ral::otg, self.usb, DAINTMSK, |mask| mask | 1 << (ep + 16));

        self.out_endpoints[ep] = Some(EndpointConfig {
            number: ep,
            direction: UsbDirection::Out,
            kind,
            max_packet_size,
            tx_fifo: None,
        });
        debug!("EP{} OUT {:?} MPS {}", ep, kind, max_packet_size);
        Ok(())
    }

    fn in_config(&self, ep: usize) -> Result<EndpointConfig, Error> {
        check_endpoint(ep)?;
        self.in_endpoints[ep].ok_or(Error::Fatal)
    }

    fn out_config(&self, ep: usize) -> Result<EndpointConfig, Error> {
        check_endpoint(ep)?;
        self.out_endpoints[ep].ok_or(Error::Fatal)
    }

    /// Arm IN endpoint `ep` to send `data`
    ///
    /// # Safety
    ///
    /// `data` must stay valid, and unmoved, until the IN descriptor returns to
    /// idle, either by [`take_result`](Controller::take_result) or by
    /// [`abort`](Controller::abort).
    pub unsafe fn start_in(&mut self, ep: usize, data: &[u8]) -> Result<(), Error> {
        let config = self.in_config(ep)?;
        if self.in_transfers[ep].status() != Status::Idle {
            return Err(Error::Busy);
        }

        let limits = endpoint::in_limits(ep);
        let packets = packet_count(data.len(), config.max_packet_size);
        let isochronous = config.is_isochronous();
        if data.len() > limits.bytes || packets > limits.packets || (isochronous && packets > 1) {
            return Err(Error::TooLarge);
        }
        self.in_transfers[ep].arm(data.as_ptr() as *mut u8, data.len(), Kind::Data)?;

        let bank = &self.usb.IN[ep];
        ral::write_reg!(ral::otg::inep, bank, DIEPTSIZ,
            XFRSIZ: data.len() as u32, PKTCNT: packets as u32, MCNT: isochronous as u32);
        if isochronous {
            if even_frame(ral::read_reg!(ral::otg, self.usb, DSTS, FNSOF)) {
                ral::modify_reg!(ral::otg::inep, bank, DIEPCTL, SD0PID_SEVNFRM: 1);
            } else {
                ral::modify_reg!(ral::otg::inep, bank, DIEPCTL, SODDFRM: 1);
            }
        }
        ral::modify_reg!(ral::otg::inep, bank, DIEPCTL, CNAK: 1, EPENA: 1);

        if isochronous {
            let written = fifo::write_packet(&self.usb, ep, data);
            self.in_transfers[ep].advance(written);
            if written < data.len() {
                warn!("EP{} IN ISO SHORT {} / {}", ep, written, data.len());
            }
        } else if !data.is_empty() {
            ral::modify_reg!(ral::otg, self.usb, DIEPEMPMSK, |mask| mask | 1 << ep);
        }
        trace!("EP{} IN ARMED {}", ep, data.len());
        Ok(())
    }

    /// Arm OUT endpoint `ep` to receive into `buffer`
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid, unmoved, and untouched until the OUT
    /// descriptor returns to idle.
    pub unsafe fn start_out(&mut self, ep: usize, buffer: &mut [u8]) -> Result<(), Error> {
        let config = self.out_config(ep)?;
        if self.out_transfers[ep].status() != Status::Idle {
            return Err(Error::Busy);
        }

        let limits = endpoint::out_limits(ep);
        let max_packet_size = config.max_packet_size as usize;
        let packets = packet_count(buffer.len(), config.max_packet_size)
            .min(limits.packets)
            .min(limits.bytes / max_packet_size);
        self.out_transfers[ep].arm(buffer.as_mut_ptr(), buffer.len(), Kind::Data)?;

        let bank = &self.usb.OUT[ep];
        ral::write_reg!(ral::otg::outep, bank, DOEPTSIZ,
            XFRSIZ: (packets * max_packet_size) as u32, PKTCNT: packets as u32);
        if config.is_isochronous() {
            if even_frame(ral::read_reg!(ral::otg, self.usb, DSTS, FNSOF)) {
                ral::modify_reg!(ral::otg::outep, bank, DOEPCTL, SD0PID_SEVNFRM: 1);
            } else {
                ral::modify_reg!(ral::otg::outep, bank, DOEPCTL, SODDFRM: 1);
            }
        }
        ral::modify_reg!(ral::otg::outep, bank, DOEPCTL, CNAK: 1, EPENA: 1);
        trace!("EP{} OUT ARMED {}", ep, buffer.len());
        Ok(())
    }

    /// Arm control endpoint `ep` to receive a SETUP packet into `buffer`
    ///
    /// # Safety
    ///
    /// See [`start_out`](Controller::start_out).
    pub unsafe fn start_setup(&mut self, ep: usize, buffer: &mut [u8]) -> Result<(), Error> {
        let config = self.out_config(ep)?;
        if config.kind != EndpointType::Control || buffer.len() < SETUP_PACKET_SIZE {
            return Err(Error::InvalidConfiguration);
        }
        self.out_transfers[ep].arm(buffer.as_mut_ptr(), SETUP_PACKET_SIZE, Kind::Setup)?;

        let bank = &self.usb.OUT[ep];
        ral::write_reg!(ral::otg::outep, bank, DOEPTSIZ,
            STUPCNT: 3, PKTCNT: 1, XFRSIZ: 3 * SETUP_PACKET_SIZE as u32);
        ral::modify_reg!(ral::otg::outep, bank, DOEPCTL, EPENA: 1);
        trace!("EP{} SETUP ARMED", ep);
        Ok(())
    }

    fn transfer(&self, direction: UsbDirection, ep: usize) -> Option<&Transfer> {
        match direction {
            UsbDirection::In => self.in_transfers.get(ep),
            UsbDirection::Out => self.out_transfers.get(ep),
        }
    }

    fn transfer_mut(&mut self, direction: UsbDirection, ep: usize) -> Option<&mut Transfer> {
        match direction {
            UsbDirection::In => self.in_transfers.get_mut(ep),
            UsbDirection::Out => self.out_transfers.get_mut(ep),
        }
    }

    /// Returns the state of an endpoint's descriptor
    pub fn status(&self, direction: UsbDirection, ep: usize) -> Option<Status> {
        self.transfer(direction, ep).map(Transfer::status)
    }

    /// Take a resolved transfer's result, returning its descriptor to idle
    pub fn take_result(&mut self, direction: UsbDirection, ep: usize) -> Option<Result<usize, Error>> {
        self.transfer_mut(direction, ep)?.take()
    }

    /// Drop an endpoint's transfer, and forcibly disable the endpoint
    ///
    /// The descriptor is idle when this returns, even if the transmit FIFO
    /// flush fails. The EPDISD that the core raises later never fails a
    /// transfer armed in the meantime.
    pub fn abort(&mut self, direction: UsbDirection, ep: usize) -> Result<(), Error> {
        check_endpoint(ep)?;
        match direction {
            UsbDirection::In => {
                self.in_transfers[ep].release();
                self.in_stopping[ep] |= self.stop_in(ep);
                self.flush_tx_fifo(ep as u32)
            }
            UsbDirection::Out => {
                self.out_transfers[ep].release();
                self.out_stopping[ep] |= self.stop_out(ep);
                Ok(())
            }
        }
    }

    /// Set the device address
    pub fn set_device_address(&mut self, address: u8) -> Result<(), Error> {
        if address > 127 {
            return Err(Error::InvalidConfiguration);
        }
        ral::modify_reg!(ral::otg, self.usb, DCFG, DAD: address as u32);
        debug!("ADDRESS {}", address);
        Ok(())
    }

    pub fn stall_in_endpoint(&mut self, ep: usize) -> Result<(), Error> {
        check_endpoint(ep)?;
        let bank = &self.usb.IN[ep];
        if ral::read_reg!(ral::otg::inep, bank, DIEPCTL, EPENA == 1) {
            ral::modify_reg!(ral::otg::inep, bank, DIEPCTL, STALL: 1, EPDIS: 1);
        } else {
            ral::modify_reg!(ral::otg::inep, bank, DIEPCTL, STALL: 1);
        }
        Ok(())
    }

    pub fn stall_out_endpoint(&mut self, ep: usize) -> Result<(), Error> {
        check_endpoint(ep)?;
        ral::modify_reg!(ral::otg::outep, &self.usb.OUT[ep], DOEPCTL, STALL: 1);
        Ok(())
    }

    /// Clear a stall, and reset the data toggle of a bulk or interrupt IN endpoint
    pub fn clear_in_stall(&mut self, ep: usize) -> Result<(), Error> {
        check_endpoint(ep)?;
        let bank = &self.usb.IN[ep];
        ral::modify_reg!(ral::otg::inep, bank, DIEPCTL, STALL: 0);
        if matches!(self.in_endpoints[ep].map(|config| config.kind), Some(EndpointType::Bulk | EndpointType::Interrupt)) {
            ral::modify_reg!(ral::otg::inep, bank, DIEPCTL, SD0PID_SEVNFRM: 1);
        }
        Ok(())
    }

    /// Clear a stall, and reset the data toggle of a bulk or interrupt OUT endpoint
    pub fn clear_out_stall(&mut self, ep: usize) -> Result<(), Error> {
        check_endpoint(ep)?;
        let bank = &self.usb.OUT[ep];
        ral::modify_reg!(ral::otg::outep, bank, DOEPCTL, STALL: 0);
        if matches!(self.out_endpoints[ep].map(|config| config.kind), Some(EndpointType::Bulk | EndpointType::Interrupt)) {
            ral::modify_reg!(ral::otg::outep, bank, DOEPCTL, SD0PID_SEVNFRM: 1);
        }
        Ok(())
    }

    pub fn is_in_stalled(&self, ep: usize) -> bool {
        ep < ENDPOINT_COUNT && ral::read_reg!(ral::otg::inep, &self.usb.IN[ep], DIEPCTL, STALL == 1)
    }

    pub fn is_out_stalled(&self, ep: usize) -> bool {
        ep < ENDPOINT_COUNT && ral::read_reg!(ral::otg::outep, &self.usb.OUT[ep], DOEPCTL, STALL == 1)
    }

    /// Stop IN endpoint `ep`, if it's enabled
    ///
    /// An armed transfer fails with `Disabled` once the core confirms.
    pub fn disable_in_endpoint(&mut self, ep: usize) -> Result<(), Error> {
        check_endpoint(ep)?;
        self.stop_in(ep);
        Ok(())
    }

    /// Stop OUT endpoint `ep`, if it's enabled
    ///
    /// An armed transfer fails with `Disabled` once the core confirms.
    pub fn disable_out_endpoint(&mut self, ep: usize) -> Result<(), Error> {
        check_endpoint(ep)?;
        self.stop_out(ep);
        Ok(())
    }

    /// Request a disable of IN endpoint `ep`; returns `true` if the core will
    /// answer with EPDISD
    fn stop_in(&mut self, ep: usize) -> bool {
        let bank = &self.usb.IN[ep];
        let enabled = ral::read_reg!(ral::otg::inep, bank, DIEPCTL, EPENA == 1);
        if enabled {
            ral::modify_reg!(ral::otg::inep, bank, DIEPCTL, EPDIS: 1, SNAK: 1);
        }
        ral::modify_reg!(ral::otg, self.usb, DIEPEMPMSK, |mask| mask & !(1 << ep));
        enabled
    }

    fn stop_out(&mut self, ep: usize) -> bool {
        let bank = &self.usb.OUT[ep];
        let enabled = ral::read_reg!(ral::otg::outep, bank, DOEPCTL, EPENA == 1);
        if enabled {
            ral::modify_reg!(ral::otg::outep, bank, DOEPCTL, EPDIS: 1, SNAK: 1);
        }
        enabled
    }

    /// Returns `true` if IN endpoint `ep` is enabled, and not being disabled
    pub fn is_in_endpoint_enabled(&self, ep: usize) -> bool {
        ep < ENDPOINT_COUNT && {
            let control = ral::read_reg!(ral::otg::inep, &self.usb.IN[ep], DIEPCTL);
            control & ral::otg::inep::DIEPCTL::EPENA::mask != 0
                && control & ral::otg::inep::DIEPCTL::EPDIS::mask == 0
        }
    }

    /// Returns `true` if OUT endpoint `ep` is enabled, and not being disabled
    pub fn is_out_endpoint_enabled(&self, ep: usize) -> bool {
        ep < ENDPOINT_COUNT && {
            let control = ral::read_reg!(ral::otg::outep, &self.usb.OUT[ep], DOEPCTL);
            control & ral::otg::outep::DOEPCTL::EPENA::mask != 0
                && control & ral::otg::outep::DOEPCTL::EPDIS::mask == 0
        }
    }

    /// Service the pending bus interrupts, once
    ///
    /// Returns `None` if nothing was pending, or if the controller is
    /// disconnected. Otherwise, returns the bus events that were observed,
    /// along with any hardware failure hit while servicing them. The events
    /// are reported even when servicing fails.
    pub fn poll(&mut self) -> Option<Serviced> {
        if ral::read_reg!(ral::otg, self.usb, GAHBCFG, GINT == 0) {
            return None;
        }
        let status = ral::read_reg!(ral::otg, self.usb, GINTSTS)
            & ral::read_reg!(ral::otg, self.usb, GINTMSK);
        let interrupts = Interrupts::from_bits_truncate(status);
        if interrupts.is_empty() {
            return None;
        }

        let latched = (interrupts & Interrupts::LATCHED).bits();
        if latched != 0 {
            ral::write_reg!(ral::otg, self.usb, GINTSTS, latched);
        }

        let mut events = Events::empty();
        let mut error = None;

        if interrupts.contains(Interrupts::USB_RESET) {
            error = self.on_reset().err();
            events |= Events::RESET;
        }
        if interrupts.contains(Interrupts::ENUMERATION_DONE) {
            self.on_enumeration_done();
            events |= Events::ENUMERATION_DONE;
        }
        if interrupts.contains(Interrupts::USB_SUSPEND) {
            debug!("SUSPEND");
            self.active = false;
            events |= Events::SUSPEND;
        }
        if interrupts.contains(Interrupts::WAKEUP) {
            debug!("WAKEUP");
            self.active = true;
            events |= Events::RESUME;
        }
        if interrupts.intersects(Interrupts::INCOMPLETE_ISO_IN | Interrupts::INCOMPLETE_ISO_OUT) {
            trace!("ISO INCOMPLETE");
            events |= Events::ISO_INCOMPLETE;
        }
        if interrupts.contains(Interrupts::RX_FIFO_LEVEL) {
            self.on_rx_fifo_level();
        }
        if interrupts.contains(Interrupts::IN_ENDPOINT) {
            self.on_in_endpoints();
        }
        if interrupts.contains(Interrupts::OUT_ENDPOINT) {
            self.on_out_endpoints();
        }

        Some(Serviced { events, error })
    }

    fn on_reset(&mut self) -> Result<(), Error> {
        debug!("RESET");
        let flushed = self
            .flush_tx_fifo(ALL_TX_FIFOS)
            .and_then(|()| self.flush_rx_fifo());
        if let Err(_error) = flushed {
            warn!("RESET FLUSH {:?}", _error);
        }

        ral::modify_reg!(ral::otg, self.usb, DCTL, RWUSIG: 0);
        for ep in 0..ENDPOINT_COUNT {
            self.in_stopping[ep] |= self.stop_in(ep);
            ral::write_reg!(ral::otg::inep, &self.usb.IN[ep], DIEPINT, 0xFF);

            self.out_stopping[ep] |= self.stop_out(ep);
            ral::modify_reg!(ral::otg::outep, &self.usb.OUT[ep], DOEPCTL, SNAK: 1);
            ral::write_reg!(ral::otg::outep, &self.usb.OUT[ep], DOEPINT, 0xFF);
        }
        self.fail_armed(Error::Reset);

        ral::modify_reg!(ral::otg, self.usb, DCFG, DAD: 0);
        self.baseline_masks();
        self.active = true;
        flushed
    }

    fn on_enumeration_done(&mut self) {
        let speed = ral::read_reg!(ral::otg, self.usb, DSTS, ENUMSPD);
        if speed != FULL_SPEED {
            warn!("ENUMERATED AT SPEED {}", speed);
        }
        let turnaround = self.config.turnaround_time as u32;
        ral::modify_reg!(ral::otg, self.usb, GUSBCFG, TRDT: turnaround);
        ral::modify_reg!(ral::otg, self.usb, DCTL, CGINAK: 1);
        self.active = true;
        debug!("ENUMERATION DONE");
    }

    fn on_rx_fifo_level(&mut self) {
        let status = RxStatus(ral::read_reg!(ral::otg, self.usb, GRXSTSP));
        match status.packet_status() {
            packet_status::OUT_DATA => {
                self.receive(status.endpoint(), status.byte_count(), Kind::Data)
            }
            packet_status::SETUP_DATA => {
                self.receive(status.endpoint(), status.byte_count(), Kind::Setup)
            }
            packet_status::GLOBAL_OUT_NAK
            | packet_status::OUT_COMPLETE
            | packet_status::SETUP_COMPLETE => {
                trace!("RX STATUS {} EP{}", status.packet_status(), status.endpoint());
            }
            _other => {
                warn!("RX STATUS UNKNOWN {}", _other);
            }
        }
    }

    /// Move a received packet into its endpoint's descriptor, or drop it
    fn receive(&mut self, ep: usize, size: usize, kind: Kind) {
        let fifo = &self.usb.FIFO[0];
        let transfer = match self.out_transfers.get_mut(ep) {
            Some(transfer) if transfer.is_armed() && transfer.kind() == kind => transfer,
            _ => {
                trace!("EP{} OUT DROPPED {}", ep, size);
                fifo::dump_packet(fifo, size);
                return;
            }
        };

        if kind == Kind::Setup {
            transfer.rewind();
        }
        let count = size.min(transfer.remaining());
        // Safety: an armed OUT descriptor holds the caller's mutable buffer.
        let dst = unsafe { transfer.unfilled() };
        fifo::read_packet(fifo, &mut dst[..count]);
        fifo::dump_packet(fifo, (fifo::words(size) - fifo::words(count)) * 4);
        transfer.advance(count);

        if count < size {
            warn!("EP{} OUT OVERFLOW {} / {}", ep, count, size);
            transfer.overflow();
        }
    }

    fn on_in_endpoints(&mut self) {
        let pending = ral::read_reg!(ral::otg, self.usb, DAINT, IEPINT)
            & ral::read_reg!(ral::otg, self.usb, DAINTMSK, IEPINT);
        let mask = ral::read_reg!(ral::otg, self.usb, DIEPMSK);
        let empty_mask = ral::read_reg!(ral::otg, self.usb, DIEPEMPMSK, INEPTXFEM);

        for ep in (0..ENDPOINT_COUNT).filter(|&ep| pending & 1 << ep != 0) {
            use ral::otg::inep::DIEPINT::{EPDISD, TOC, TXFE, XFRC};

            let mut enabled = mask;
            if empty_mask & 1 << ep != 0 {
                enabled |= TXFE::mask;
            }
            let bank = &self.usb.IN[ep];
            let interrupts = ral::read_reg!(ral::otg::inep, bank, DIEPINT) & enabled;
            // TXFE reflects the FIFO level, and can't be cleared.
            let clear = interrupts & !TXFE::mask;
            ral::write_reg!(ral::otg::inep, bank, DIEPINT, clear);

            if interrupts & XFRC::mask != 0 {
                ral::modify_reg!(ral::otg, self.usb, DIEPEMPMSK, |mask| mask & !(1 << ep));
                if self.in_transfers[ep].complete() {
                    trace!("EP{} IN COMPLETE", ep);
                }
            }
            if interrupts & EPDISD::mask != 0 {
                if core::mem::take(&mut self.in_stopping[ep]) {
                    trace!("EP{} IN STOPPED", ep);
                } else if self.in_transfers[ep].fail(Error::Disabled) {
                    warn!("EP{} IN DISABLED", ep);
                }
            }
            if interrupts & TOC::mask != 0 {
                warn!("EP{} IN TIMEOUT", ep);
            }
            if interrupts & TXFE::mask != 0 {
                self.refill(ep);
            }
        }
    }

    /// Push the next packets of an IN transfer, for as long as the FIFO has room
    fn refill(&mut self, ep: usize) {
        let max_packet_size = match self.in_endpoints[ep] {
            Some(config) if self.in_transfers[ep].is_armed() => config.max_packet_size as usize,
            _ => {
                ral::modify_reg!(ral::otg, self.usb, DIEPEMPMSK, |mask| mask & !(1 << ep));
                return;
            }
        };

        let transfer = &mut self.in_transfers[ep];
        while transfer.remaining() > 0 {
            // Packets start on word boundaries, so only finish the current one.
            let packet_left = max_packet_size - transfer.offset() % max_packet_size;
            // Safety: the descriptor is armed.
            let unsent = unsafe { transfer.unsent() };
            let chunk = &unsent[..packet_left.min(unsent.len())];
            let len = chunk.len();
            let written = fifo::write_packet(&self.usb, ep, chunk);
            transfer.advance(written);
            if written < len {
                break;
            }
        }

        if transfer.remaining() == 0 {
            ral::modify_reg!(ral::otg, self.usb, DIEPEMPMSK, |mask| mask & !(1 << ep));
        }
    }

    fn on_out_endpoints(&mut self) {
        let pending = ral::read_reg!(ral::otg, self.usb, DAINT, OEPINT)
            & ral::read_reg!(ral::otg, self.usb, DAINTMSK, OEPINT);
        let mask = ral::read_reg!(ral::otg, self.usb, DOEPMSK);

        for ep in (0..ENDPOINT_COUNT).filter(|&ep| pending & 1 << ep != 0) {
            use ral::otg::outep::DOEPINT::{EPDISD, STUP, XFRC};

            let bank = &self.usb.OUT[ep];
            let interrupts = ral::read_reg!(ral::otg::outep, bank, DOEPINT) & mask;
            ral::write_reg!(ral::otg::outep, bank, DOEPINT, interrupts);

            let transfer = &mut self.out_transfers[ep];
            let done = match transfer.kind() {
                Kind::Data => interrupts & XFRC::mask != 0,
                Kind::Setup => interrupts & STUP::mask != 0,
            };
            if done && transfer.complete() {
                trace!("EP{} OUT COMPLETE", ep);
            }
            if interrupts & EPDISD::mask != 0 {
                if core::mem::take(&mut self.out_stopping[ep]) {
                    trace!("EP{} OUT STOPPED", ep);
                } else if transfer.fail(Error::Disabled) {
                    warn!("EP{} OUT DISABLED", ep);
                }
            }
        }
    }
}
