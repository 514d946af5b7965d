//! An in-process CAN bus for tests and simulation
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::frame::CanFrame;
use crate::port::{Port, PortError};

/// Simulated transmit mailbox count reported by a [VirtualPort]
///
/// Transmitted frames are delivered the moment they are handed over, so the
/// mailboxes are always empty.
const TX_MAILBOXES: u32 = 3;

#[derive(Default)]
struct BusInner {
    clock_ms: u64,
    next_port: usize,
    /// One (port id, RX queue) pair per attached port
    queues: Vec<(usize, VecDeque<CanFrame>)>,
}

/// A perfect broadcast bus: every transmitted frame lands, in FIFO order and
/// without loss, on the RX queue of every *other* attached port
///
/// The bus owns a manual millisecond clock so tests can drive transport
/// timeouts deterministically: nothing moves time forward except
/// [VirtualBus::advance].
#[derive(Clone, Default)]
pub struct VirtualBus {
    inner: Arc<Mutex<BusInner>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new port to the bus
    pub fn port(&self) -> VirtualPort {
        let mut bus = lock(&self.inner);
        let id = bus.next_port;
        bus.next_port += 1;
        bus.queues.push((id, VecDeque::new()));
        tracing::debug!("virtual port {id} online ({} on the bus)", bus.queues.len());
        VirtualPort {
            bus: Arc::clone(&self.inner),
            id,
            online: true,
        }
    }

    /// The simulated clock, in milliseconds
    #[must_use]
    pub fn now(&self) -> u64 {
        lock(&self.inner).clock_ms
    }

    /// Advance the simulated clock
    pub fn advance(&self, ms: u64) {
        lock(&self.inner).clock_ms += ms;
    }

    /// Number of attached ports
    #[must_use]
    pub fn ports(&self) -> usize {
        lock(&self.inner).queues.len()
    }
}

/// One attachment point on a [VirtualBus]
pub struct VirtualPort {
    bus: Arc<Mutex<BusInner>>,
    id: usize,
    online: bool,
}

fn lock(bus: &Arc<Mutex<BusInner>>) -> MutexGuard<'_, BusInner> {
    bus.lock().expect("virtual bus lock poisoned")
}

impl Port for VirtualPort {
    fn deinit(&mut self) -> Result<(), PortError> {
        if self.online {
            let mut bus = lock(&self.bus);
            bus.queues.retain(|(id, _)| *id != self.id);
            tracing::debug!("virtual port {} offline", self.id);
            self.online = false;
        }
        Ok(())
    }

    fn tick(&self) -> u64 {
        lock(&self.bus).clock_ms
    }

    fn tx_free_level(&self) -> u32 {
        if self.online { TX_MAILBOXES } else { 0 }
    }

    fn rx_fill_level(&self) -> u32 {
        let bus = lock(&self.bus);
        bus.queues
            .iter()
            .find(|(id, _)| *id == self.id)
            .map_or(0, |(_, queue)| queue.len() as u32)
    }

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), PortError> {
        if !self.online {
            return Err(PortError::Offline);
        }
        let mut bus = lock(&self.bus);
        for (id, queue) in &mut bus.queues {
            if *id != self.id {
                queue.push_back(*frame);
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<CanFrame> {
        let mut bus = lock(&self.bus);
        let (_, queue) = bus.queues.iter_mut().find(|(id, _)| *id == self.id)?;
        queue.pop_front()
    }
}

impl Drop for VirtualPort {
    fn drop(&mut self) {
        // Detach so a dropped port stops accumulating frames
        let _ = self.deinit();
    }
}
