//! The shared USB bus, and its blocking transfer calls

use crate::{
    driver::{Config, Controller},
    endpoint::EndpointConfig,
    event::{BusEvent, Listener},
    scheduler::Scheduler,
    transfer::Status,
    Error, Peripherals,
};
use core::cell::RefCell;
use critical_section::Mutex;
use usb_device::{endpoint::EndpointType, UsbDirection};

/// Listeners that a bus can hold
const MAX_LISTENERS: usize = 4;

type Listeners<'a> = [Option<&'a (dyn Listener + Sync)>; MAX_LISTENERS];

/// A USB device bus, shared by the tasks that use it
///
/// The `Bus` owns the OTG_FS core. One task runs [`run`](Bus::run), which
/// services bus events and resolves transfers. Other tasks call the blocking
/// transfer functions, which arm an endpoint and yield to the scheduler until
/// the handler resolves the transfer. Tasks may share a `&Bus`, and may use
/// disjoint endpoints concurrently.
///
/// # Requirements
///
/// The driver assumes that you've prepared the OTG_FS clocks, including the
/// 48MHz USB clock, and routed the D+ / D- pins to the peripheral.
///
/// # Example
///
/// This example shows you how to create a `Bus`, prepare endpoints, and
/// exchange data on a bulk endpoint pair. It skips the clock and pin setup.
///
/// ```no_run
/// # struct Otg; unsafe impl otgfs_usbd::Peripherals for Otg { fn otg(&self) -> *const () { 0x5000_0000 as _ } }
/// # struct Executor; impl otgfs_usbd::Scheduler for Executor { fn yield_now(&self) {} fn now_ms(&self) -> u64 { 0 } }
/// use otgfs_usbd::{Bus, Config, EndpointType};
///
/// fn usb_task(bus: &Bus<Executor>) -> ! {
///     bus.run()
/// }
///
/// fn echo_task(bus: &Bus<Executor>) {
///     let mut buffer = [0; 64];
///     loop {
///         if let Ok(received) = bus.out_transfer(1, &mut buffer, 1000) {
///             let _ = bus.in_transfer(1, &buffer[..received], 1000);
///         }
///     }
/// }
///
/// let bus = Bus::new(Otg, Executor, Config::default());
/// bus.init().unwrap();
/// bus.set_rx_fifo_size(128).unwrap();
/// bus.set_tx_fifo_size(0, 16).unwrap();
/// bus.set_tx_fifo_size(1, 64).unwrap();
/// bus.configure_in_endpoint(0, EndpointType::Control, 64).unwrap();
/// bus.configure_out_endpoint(0, EndpointType::Control, 64).unwrap();
/// bus.configure_in_endpoint(1, EndpointType::Bulk, 64).unwrap();
/// bus.configure_out_endpoint(1, EndpointType::Bulk, 64).unwrap();
/// bus.connect();
///
/// // Spawn usb_task(&bus) and echo_task(&bus) with your executor...
/// # echo_task(&bus);
/// # usb_task(&bus);
/// ```
pub struct Bus<'a, S> {
    usb: Mutex<RefCell<Controller>>,
    listeners: Mutex<RefCell<Listeners<'a>>>,
    scheduler: S,
}

impl<'a, S: Scheduler> Bus<'a, S> {
    /// Create a bus that owns the OTG_FS peripheral
    ///
    /// Call [`init`](Bus::init) before anything else.
    pub fn new<P: Peripherals>(peripherals: P, scheduler: S, config: Config) -> Self {
        Bus {
            usb: Mutex::new(RefCell::new(Controller::new(peripherals, config))),
            listeners: Mutex::new(RefCell::new([None; MAX_LISTENERS])),
            scheduler,
        }
    }

    /// Interrupt-safe, immutable access to the USB controller
    fn with_usb<R>(&self, func: impl FnOnce(&Controller) -> R) -> R {
        critical_section::with(|cs| {
            let usb = self.usb.borrow(cs);
            let usb = usb.borrow();
            func(&*usb)
        })
    }

    /// Interrupt-safe, mutable access to the USB controller
    fn with_usb_mut<R>(&self, func: impl FnOnce(&mut Controller) -> R) -> R {
        critical_section::with(|cs| {
            let usb = self.usb.borrow(cs);
            let mut usb = usb.borrow_mut();
            func(&mut *usb)
        })
    }

    /// Reset the core, and bring it up in device mode
    ///
    /// Forgets every endpoint configuration and FIFO allocation. The device
    /// stays off the bus until [`connect`](Bus::connect).
    pub fn init(&self) -> Result<(), Error> {
        self.with_usb_mut(Controller::initialize)
    }

    /// Signal the device's presence to the host
    pub fn connect(&self) {
        self.with_usb_mut(Controller::connect);
    }

    /// Leave the bus
    ///
    /// Blocked transfers return `Disabled`, and the handler services nothing
    /// until the next [`connect`](Bus::connect).
    pub fn disconnect(&self) {
        self.with_usb_mut(Controller::disconnect);
    }

    /// Returns `true` if the bus is active
    pub fn is_active(&self) -> bool {
        self.with_usb(Controller::is_active)
    }

    /// The frame number of the last SOF
    pub fn frame_number(&self) -> u16 {
        self.with_usb(Controller::frame_number)
    }

    /// Size the receive FIFO, shared by all OUT endpoints
    ///
    /// Requests are rounded up to 16 words. Returns the allocated words.
    pub fn set_rx_fifo_size(&self, words: u16) -> Result<u16, Error> {
        self.with_usb_mut(|usb| usb.set_rx_fifo_size(words))
    }

    /// Size the transmit FIFO of IN endpoint `ep`
    ///
    /// Requests are rounded up to 16 words. Returns the allocated words.
    pub fn set_tx_fifo_size(&self, ep: usize, words: u16) -> Result<u16, Error> {
        self.with_usb_mut(|usb| usb.set_tx_fifo_size(ep, words))
    }

    pub fn configure_in_endpoint(
        &self,
        ep: usize,
        kind: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.configure_in_endpoint(ep, kind, max_packet_size))
    }

    pub fn configure_out_endpoint(
        &self,
        ep: usize,
        kind: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.configure_out_endpoint(ep, kind, max_packet_size))
    }

    /// Returns IN endpoint `ep`'s configuration
    pub fn in_endpoint(&self, ep: usize) -> Option<EndpointConfig> {
        self.with_usb(|usb| usb.in_endpoint(ep))
    }

    /// Returns OUT endpoint `ep`'s configuration
    pub fn out_endpoint(&self, ep: usize) -> Option<EndpointConfig> {
        self.with_usb(|usb| usb.out_endpoint(ep))
    }

    /// Returns the state of an endpoint's transfer descriptor
    pub fn transfer_status(&self, direction: UsbDirection, ep: usize) -> Option<Status> {
        self.with_usb(|usb| usb.status(direction, ep))
    }

    /// Send `data` on IN endpoint `ep`
    ///
    /// Blocks until the host takes the data, returning the bytes sent. Returns
    /// `Timeout` if the transfer doesn't finish within `timeout_ms`
    /// milliseconds. Zero-length packets are never appended; send an empty
    /// `data` to end a transfer that fills its last packet.
    pub fn in_transfer(&self, ep: usize, data: &[u8], timeout_ms: u64) -> Result<usize, Error> {
        let started = self.scheduler.now_ms();
        // Safety: the pending transfer returns the descriptor to idle before
        // this call stops borrowing `data`.
        self.with_usb_mut(|usb| unsafe { usb.start_in(ep, data) })?;
        self.pending(UsbDirection::In, ep).wait(started, timeout_ms)
    }

    /// Receive into `buffer` from OUT endpoint `ep`
    ///
    /// Blocks until the transfer finishes, returning the bytes received. A
    /// short packet finishes the transfer early. If the host sends more than
    /// `buffer` holds, the excess is dropped, and the call returns `Overflow`.
    pub fn out_transfer(&self, ep: usize, buffer: &mut [u8], timeout_ms: u64) -> Result<usize, Error> {
        let started = self.scheduler.now_ms();
        // Safety: see in_transfer.
        self.with_usb_mut(|usb| unsafe { usb.start_out(ep, buffer) })?;
        self.pending(UsbDirection::Out, ep).wait(started, timeout_ms)
    }

    /// Receive a SETUP packet from control endpoint `ep`
    ///
    /// `buffer` must hold at least 8 bytes. If the host sends back-to-back
    /// SETUP packets, `buffer` holds the latest one.
    pub fn setup_transfer(&self, ep: usize, buffer: &mut [u8], timeout_ms: u64) -> Result<usize, Error> {
        let started = self.scheduler.now_ms();
        // Safety: see in_transfer.
        self.with_usb_mut(|usb| unsafe { usb.start_setup(ep, buffer) })?;
        self.pending(UsbDirection::Out, ep).wait(started, timeout_ms)
    }

    fn pending(&self, direction: UsbDirection, ep: usize) -> Pending<'_, 'a, S> {
        Pending {
            bus: self,
            direction,
            ep,
            finished: false,
        }
    }

    /// Set the device address, and tell the listeners
    pub fn set_device_address(&self, address: u8) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.set_device_address(address))?;
        self.broadcast(BusEvent::AddressAssigned(address));
        Ok(())
    }

    pub fn stall_in_endpoint(&self, ep: usize) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.stall_in_endpoint(ep))
    }

    pub fn stall_out_endpoint(&self, ep: usize) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.stall_out_endpoint(ep))
    }

    pub fn clear_in_stall(&self, ep: usize) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.clear_in_stall(ep))
    }

    pub fn clear_out_stall(&self, ep: usize) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.clear_out_stall(ep))
    }

    pub fn is_in_stalled(&self, ep: usize) -> bool {
        self.with_usb(|usb| usb.is_in_stalled(ep))
    }

    pub fn is_out_stalled(&self, ep: usize) -> bool {
        self.with_usb(|usb| usb.is_out_stalled(ep))
    }

    /// Disable IN endpoint `ep`
    ///
    /// A transfer in flight fails with `Disabled` once the core stops the
    /// endpoint.
    pub fn disable_in_endpoint(&self, ep: usize) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.disable_in_endpoint(ep))
    }

    /// Disable OUT endpoint `ep`
    ///
    /// A transfer in flight fails with `Disabled` once the core stops the
    /// endpoint.
    pub fn disable_out_endpoint(&self, ep: usize) -> Result<(), Error> {
        self.with_usb_mut(|usb| usb.disable_out_endpoint(ep))
    }

    pub fn is_in_endpoint_enabled(&self, ep: usize) -> bool {
        self.with_usb(|usb| usb.is_in_endpoint_enabled(ep))
    }

    pub fn is_out_endpoint_enabled(&self, ep: usize) -> bool {
        self.with_usb(|usb| usb.is_out_endpoint_enabled(ep))
    }

    /// Register a listener for bus events
    ///
    /// Fails with `InvalidConfiguration` once four listeners are registered.
    pub fn subscribe(&self, listener: &'a (dyn Listener + Sync)) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut listeners = self.listeners.borrow_ref_mut(cs);
            let slot = listeners
                .iter_mut()
                .find(|slot| slot.is_none())
                .ok_or(Error::InvalidConfiguration)?;
            *slot = Some(listener);
            Ok(())
        })
    }

    fn broadcast(&self, event: BusEvent) {
        let listeners = critical_section::with(|cs| *self.listeners.borrow_ref(cs));
        for listener in listeners.iter().flatten() {
            listener.on_event(event);
        }
    }

    /// Service pending bus events once, and tell the listeners
    ///
    /// Returns `true` if anything was pending. The listeners hear every
    /// event of the pass before a hardware failure is returned.
    pub fn poll(&self) -> Result<bool, Error> {
        let Some(serviced) = self.with_usb_mut(Controller::poll) else {
            return Ok(false);
        };
        for event in serviced.events.bus_events() {
            trace!("EVENT {:?}", event);
            self.broadcast(event);
        }
        serviced.error.map_or(Ok(true), Err)
    }

    /// Service bus events, forever
    ///
    /// Run this in its own task. It only yields when there's nothing to service.
    pub fn run(&self) -> ! {
        loop {
            match self.poll() {
                Ok(true) => {}
                Ok(false) => self.scheduler.yield_now(),
                Err(_error) => {
                    warn!("HANDLER {:?}", _error);
                    self.scheduler.yield_now();
                }
            }
        }
    }
}

/// An armed transfer that its caller is waiting on
///
/// Dropping a `Pending` that hasn't resolved aborts the transfer, so the
/// descriptor never outlives the caller's buffer.
struct Pending<'b, 'a, S: Scheduler> {
    bus: &'b Bus<'a, S>,
    direction: UsbDirection,
    ep: usize,
    finished: bool,
}

impl<S: Scheduler> Pending<'_, '_, S> {
    fn wait(mut self, started: u64, timeout_ms: u64) -> Result<usize, Error> {
        let (direction, ep) = (self.direction, self.ep);
        loop {
            if let Some(result) = self.bus.with_usb_mut(|usb| usb.take_result(direction, ep)) {
                self.finished = true;
                return result;
            }
            let elapsed = self.bus.scheduler.now_ms().saturating_sub(started);
            if elapsed >= timeout_ms {
                debug!("EP{} {:?} TIMEOUT", ep, direction);
                return self.abort().unwrap_or(Err(Error::Timeout));
            }
            if self.bus.scheduler.is_cancelled() {
                debug!("EP{} {:?} CANCELLED", ep, direction);
                return self.abort().unwrap_or(Err(Error::Cancelled));
            }
            self.bus.scheduler.yield_now();
        }
    }

    /// Abort the transfer, unless it resolved after the last check
    ///
    /// Returns the result of a transfer that resolved in the meantime.
    fn abort(&mut self) -> Option<Result<usize, Error>> {
        self.finished = true;
        let (direction, ep) = (self.direction, self.ep);
        self.bus.with_usb_mut(|usb| {
            if let Some(result) = usb.take_result(direction, ep) {
                return Some(result);
            }
            if let Err(_error) = usb.abort(direction, ep) {
                warn!("EP{} {:?} ABORT {:?}", ep, direction, _error);
            }
            None
        })
    }
}

impl<S: Scheduler> Drop for Pending<'_, '_, S> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}
