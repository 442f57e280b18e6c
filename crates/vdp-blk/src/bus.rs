//! The transport seam: queue state and notifier wiring owned by the device bus.

use std::io;

use thiserror::Error;
use vdp_vring::QueueState;
use vmm_sys_util::eventfd::EventFd;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no virtqueue {0}")]
    NoSuchQueue(u16),

    #[error("{kind} notifier for queue {queue} unavailable")]
    Unavailable { kind: &'static str, queue: u16 },

    #[error("eventfd error: {0}")]
    EventFd(#[from] io::Error),
}

/// What the dataplane needs from the device transport (PCI/MMIO glue).
pub trait VirtioBus {
    /// Feature bits agreed with the guest driver.
    fn negotiated_features(&self) -> u64;

    fn queue_state(&self, queue: u16) -> Option<QueueState>;

    fn set_queue_state(&mut self, queue: u16, state: QueueState);

    /// Routes guest kicks for `queue` to an eventfd (`enable`) or back to the transport.
    ///
    /// On enable, returns a handle to the eventfd the guest's kicks signal.
    fn set_host_notifier(&mut self, queue: u16, enable: bool) -> Result<Option<EventFd>, BusError>;

    /// Routes interrupts for `queue` from an eventfd (`enable`) or back to the transport.
    ///
    /// On enable, returns a handle to the eventfd that raises the guest interrupt.
    fn set_guest_notifier(&mut self, queue: u16, enable: bool)
        -> Result<Option<EventFd>, BusError>;
}

#[derive(Debug)]
struct QueueWiring {
    state: QueueState,
    host: Option<EventFd>,
    guest: Option<EventFd>,
    /// Kicks that arrived while no host notifier was installed.
    kicks_to_transport: u64,
}

/// A self-contained transport: eventfd-based notifiers and in-memory queue state.
///
/// Stands in for the PCI/MMIO layer when the dataplane is driven by a simulated guest.
#[derive(Debug)]
pub struct StandaloneBus {
    features: u64,
    queues: Vec<QueueWiring>,
    deny_host: bool,
    deny_guest: bool,
}

impl StandaloneBus {
    pub fn new(features: u64, queues: impl IntoIterator<Item = QueueState>) -> Self {
        Self {
            features,
            queues: queues
                .into_iter()
                .map(|state| QueueWiring {
                    state,
                    host: None,
                    guest: None,
                    kicks_to_transport: 0,
                })
                .collect(),
            deny_host: false,
            deny_guest: false,
        }
    }

    /// Makes host notifier setup fail, as a transport without ioeventfd support would.
    pub fn deny_host_notifier(&mut self, deny: bool) {
        self.deny_host = deny;
    }

    pub fn deny_guest_notifier(&mut self, deny: bool) {
        self.deny_guest = deny;
    }

    fn wiring(&self, queue: u16) -> Result<&QueueWiring, BusError> {
        self.queues
            .get(usize::from(queue))
            .ok_or(BusError::NoSuchQueue(queue))
    }

    fn wiring_mut(&mut self, queue: u16) -> Result<&mut QueueWiring, BusError> {
        self.queues
            .get_mut(usize::from(queue))
            .ok_or(BusError::NoSuchQueue(queue))
    }

    /// Guest doorbell write for `queue`. Returns true if it went to the host notifier.
    pub fn kick(&mut self, queue: u16) -> Result<bool, BusError> {
        let wiring = self.wiring_mut(queue)?;
        match &wiring.host {
            Some(fd) => {
                fd.write(1)?;
                Ok(true)
            }
            None => {
                wiring.kicks_to_transport += 1;
                Ok(false)
            }
        }
    }

    /// Drains and returns the interrupt count raised through the guest notifier.
    pub fn take_interrupts(&self, queue: u16) -> u64 {
        let Ok(wiring) = self.wiring(queue) else {
            return 0;
        };
        wiring
            .guest
            .as_ref()
            .and_then(|fd| fd.read().ok())
            .unwrap_or(0)
    }

    pub fn kicks_to_transport(&self, queue: u16) -> u64 {
        self.wiring(queue).map_or(0, |w| w.kicks_to_transport)
    }

    pub fn host_notifier_enabled(&self, queue: u16) -> bool {
        self.wiring(queue).is_ok_and(|w| w.host.is_some())
    }

    pub fn guest_notifier_enabled(&self, queue: u16) -> bool {
        self.wiring(queue).is_ok_and(|w| w.guest.is_some())
    }
}

fn new_notifier() -> Result<EventFd, BusError> {
    Ok(EventFd::new(libc::EFD_NONBLOCK)?)
}

impl VirtioBus for StandaloneBus {
    fn negotiated_features(&self) -> u64 {
        self.features
    }

    fn queue_state(&self, queue: u16) -> Option<QueueState> {
        self.wiring(queue).ok().map(|w| w.state)
    }

    fn set_queue_state(&mut self, queue: u16, state: QueueState) {
        if let Ok(wiring) = self.wiring_mut(queue) {
            wiring.state = state;
        }
    }

    fn set_host_notifier(&mut self, queue: u16, enable: bool) -> Result<Option<EventFd>, BusError> {
        let deny = self.deny_host;
        let wiring = self.wiring_mut(queue)?;
        if !enable {
            // Kicks still pending on the eventfd are handed back to the transport.
            if let Some(fd) = wiring.host.take() {
                if let Ok(n) = fd.read() {
                    wiring.kicks_to_transport += n;
                }
            }
            return Ok(None);
        }
        if deny {
            return Err(BusError::Unavailable { kind: "host", queue });
        }
        let fd = new_notifier()?;
        let handle = fd.try_clone()?;
        wiring.host = Some(fd);
        Ok(Some(handle))
    }

    fn set_guest_notifier(
        &mut self,
        queue: u16,
        enable: bool,
    ) -> Result<Option<EventFd>, BusError> {
        let deny = self.deny_guest;
        let wiring = self.wiring_mut(queue)?;
        if !enable {
            wiring.guest = None;
            return Ok(None);
        }
        if deny {
            return Err(BusError::Unavailable {
                kind: "guest",
                queue,
            });
        }
        let fd = new_notifier()?;
        let handle = fd.try_clone()?;
        wiring.guest = Some(fd);
        Ok(Some(handle))
    }
}
