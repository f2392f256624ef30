//! Bus-level notifications

bitflags::bitflags! {
    /// Bus events observed by one pass of the event handler
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events : u8 {
        const RESET = 1 << 0;
        const ENUMERATION_DONE = 1 << 1;
        const SUSPEND = 1 << 2;
        const RESUME = 1 << 3;
        const ISO_INCOMPLETE = 1 << 4;
    }
}

/// A notification for the USB class layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum BusEvent {
    /// The host reset the bus; every in-flight transfer failed
    Reset,
    /// The bus finished speed enumeration
    EnumerationDone,
    /// The device accepted an address
    AddressAssigned(u8),
    /// An isochronous transfer missed its frame
    IsoIncomplete,
    /// The bus went idle
    Suspend,
    /// The bus resumed after a suspend
    Resume,
}

impl Events {
    /// Each observed event, in the order that the handler serviced them
    pub fn bus_events(self) -> impl Iterator<Item = BusEvent> {
        [
            (Events::RESET, BusEvent::Reset),
            (Events::ENUMERATION_DONE, BusEvent::EnumerationDone),
            (Events::SUSPEND, BusEvent::Suspend),
            (Events::RESUME, BusEvent::Resume),
            (Events::ISO_INCOMPLETE, BusEvent::IsoIncomplete),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, event)| event)
    }
}

/// Receives bus events
///
/// Listeners run in the event handler's task, outside of any driver borrow, so
/// they may call back into the bus. They should not block.
pub trait Listener {
    fn on_event(&self, event: BusEvent);
}
