//! A minimal in-process host.
//!
//! [`HeadlessHost`] implements every host interface the bridge needs without
//! an emulator behind it: a flat region table for address decoding,
//! scripted DMA channels, interrupt line levels, and manually advanced
//! timers. The `probe` command and the integration tests drive devices
//! through it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use extsock_frame::DmaStatus;
use extsock_transport::PacketStream;
use serde::Serialize;
use tracing::trace;

use crate::config::BridgeConfig;
use crate::device::ExtSockDevice;
use crate::error::Result;
use crate::host::{
    DmaController, DmaRead, HostBindings, InterruptController, MemoryHandler, PortHandler,
    RegionRegistry, TickCallback, TimerFacility, TimerHandle,
};
use crate::registration::RegionDescriptor;

/// Value returned for reads nothing decodes.
pub const OPEN_BUS: u8 = 0xFF;

/// Something a device did to the host outside of a CPU access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    IrqRaised { line: u8 },
    IrqLowered { line: u8 },
    DmaRead { channel: u8, data: u16, no_data: bool },
    DmaWrite { channel: u8, data: u16 },
}

#[derive(Clone)]
enum Mapping {
    Memory(Arc<dyn MemoryHandler>),
    Ports(Arc<dyn PortHandler>),
}

#[derive(Default)]
struct HostState {
    regions: Vec<(RegionDescriptor, Mapping)>,
    irq_lines: BTreeMap<u8, bool>,
    dma_reads: HashMap<u8, VecDeque<DmaRead>>,
    dma_write_status: DmaStatus,
    dma_writes: Vec<(u8, u16)>,
    events: Vec<HostEvent>,
}

struct Timer {
    period: u64,
    callback: TickCallback,
    enabled: Arc<AtomicBool>,
}

impl Timer {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

type TimerTable = Mutex<Vec<Timer>>;

/// Cloneable handle to one shared headless host.
#[derive(Clone, Default)]
pub struct HeadlessHost {
    state: Arc<Mutex<HostState>>,
    timers: Arc<TimerTable>,
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a device process and attach it to this host.
    pub fn open(&self, config: &BridgeConfig) -> Result<ExtSockDevice> {
        let mut registry = self.clone();
        let mut timers = self.clone();
        ExtSockDevice::open(config, &mut registry, &mut timers, self.bindings())
    }

    /// Attach an already connected device process to this host.
    pub fn attach(&self, stream: PacketStream, config: &BridgeConfig) -> Result<ExtSockDevice> {
        let mut registry = self.clone();
        let mut timers = self.clone();
        ExtSockDevice::attach(stream, config, &mut registry, &mut timers, self.bindings())
    }

    pub fn bindings(&self) -> HostBindings {
        HostBindings {
            dma: self.dma(),
            interrupts: self.interrupts(),
        }
    }

    pub fn dma(&self) -> Box<dyn DmaController> {
        Box::new(self.clone())
    }

    pub fn interrupts(&self) -> Box<dyn InterruptController> {
        Box::new(self.clone())
    }

    /// Regions mapped so far, in registration order.
    pub fn regions(&self) -> Vec<RegionDescriptor> {
        self.state().regions.iter().map(|(region, _)| *region).collect()
    }

    /// CPU memory read. Unmapped addresses read as [`OPEN_BUS`].
    pub fn mem_read(&self, addr: u32) -> Result<u8> {
        match self.memory_handler(addr) {
            Some(handler) => handler.mmio_read(addr),
            None => {
                trace!(addr, "unmapped memory read");
                Ok(OPEN_BUS)
            }
        }
    }

    /// CPU memory write. Unmapped writes are dropped.
    pub fn mem_write(&self, addr: u32, value: u8) -> Result<()> {
        match self.memory_handler(addr) {
            Some(handler) => handler.mmio_write(addr, value),
            None => {
                trace!(addr, value, "unmapped memory write");
                Ok(())
            }
        }
    }

    pub fn io_read(&self, port: u16) -> Result<u8> {
        match self.port_handler(port) {
            Some(handler) => handler.io_read(port),
            None => {
                trace!(port, "unmapped io read");
                Ok(OPEN_BUS)
            }
        }
    }

    pub fn io_write(&self, port: u16, value: u8) -> Result<()> {
        match self.port_handler(port) {
            Some(handler) => handler.io_write(port, value),
            None => {
                trace!(port, value, "unmapped io write");
                Ok(())
            }
        }
    }

    /// Script the result of the next read on `channel`. Channels with
    /// nothing queued report no data.
    pub fn queue_dma_read(&self, channel: u8, read: DmaRead) {
        self.state()
            .dma_reads
            .entry(channel)
            .or_default()
            .push_back(read);
    }

    /// Status returned for every subsequent DMA channel write.
    pub fn set_dma_write_status(&self, status: DmaStatus) {
        self.state().dma_write_status = status;
    }

    /// Words written to DMA channels, oldest first.
    pub fn dma_writes(&self) -> Vec<(u8, u16)> {
        self.state().dma_writes.clone()
    }

    pub fn irq_level(&self, line: u8) -> bool {
        self.state().irq_lines.get(&line).copied().unwrap_or(false)
    }

    /// Drain the event log.
    pub fn take_events(&self) -> Vec<HostEvent> {
        std::mem::take(&mut self.state().events)
    }

    /// Fire every enabled timer once. Returns how many fired.
    ///
    /// Callbacks run on the calling thread with no host lock held, so they
    /// may use the host's controllers and schedule or disable timers.
    pub fn advance_timers(&self) -> usize {
        let mut firing = std::mem::take(&mut *lock_timers(&self.timers));
        firing.retain(Timer::is_enabled);
        for timer in firing.iter_mut() {
            trace!(period = timer.period, "timer fired");
            (timer.callback)();
        }
        let fired = firing.len();

        let mut timers = lock_timers(&self.timers);
        firing.retain(Timer::is_enabled);
        firing.append(&mut timers);
        *timers = firing;
        fired
    }

    pub fn active_timers(&self) -> usize {
        lock_timers(&self.timers)
            .iter()
            .filter(|timer| timer.is_enabled())
            .count()
    }

    fn memory_handler(&self, addr: u32) -> Option<Arc<dyn MemoryHandler>> {
        self.state()
            .regions
            .iter()
            .find_map(|(region, mapping)| match mapping {
                Mapping::Memory(handler) if region.contains(addr) => Some(Arc::clone(handler)),
                _ => None,
            })
    }

    fn port_handler(&self, port: u16) -> Option<Arc<dyn PortHandler>> {
        self.state()
            .regions
            .iter()
            .find_map(|(region, mapping)| match mapping {
                Mapping::Ports(handler) if region.contains(u32::from(port)) => {
                    Some(Arc::clone(handler))
                }
                _ => None,
            })
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegionRegistry for HeadlessHost {
    fn map_memory(&mut self, base: u32, size: u32, handler: Arc<dyn MemoryHandler>) {
        self.state()
            .regions
            .push((RegionDescriptor::memory(base, size), Mapping::Memory(handler)));
    }

    fn map_ports(&mut self, base: u16, size: u16, handler: Arc<dyn PortHandler>) {
        self.state()
            .regions
            .push((RegionDescriptor::io(base, size), Mapping::Ports(handler)));
    }
}

impl DmaController for HeadlessHost {
    fn channel_read(&mut self, channel: u8) -> DmaRead {
        let mut state = self.state();
        let read = state
            .dma_reads
            .get_mut(&channel)
            .and_then(VecDeque::pop_front)
            .unwrap_or(DmaRead::NO_DATA);
        state.events.push(HostEvent::DmaRead {
            channel,
            data: read.data,
            no_data: read.status.no_data,
        });
        read
    }

    fn channel_write(&mut self, channel: u8, data: u16) -> DmaStatus {
        let mut state = self.state();
        state.dma_writes.push((channel, data));
        state.events.push(HostEvent::DmaWrite { channel, data });
        state.dma_write_status
    }
}

impl InterruptController for HeadlessHost {
    fn raise(&mut self, line: u8) {
        let mut state = self.state();
        state.irq_lines.insert(line, true);
        state.events.push(HostEvent::IrqRaised { line });
    }

    fn lower(&mut self, line: u8) {
        let mut state = self.state();
        state.irq_lines.insert(line, false);
        state.events.push(HostEvent::IrqLowered { line });
    }
}

impl TimerFacility for HeadlessHost {
    fn schedule_periodic(&mut self, period: u64, callback: TickCallback) -> Box<dyn TimerHandle> {
        let enabled = Arc::new(AtomicBool::new(true));
        lock_timers(&self.timers).push(Timer {
            period,
            callback,
            enabled: Arc::clone(&enabled),
        });
        Box::new(HeadlessTimer {
            enabled,
            table: Arc::downgrade(&self.timers),
        })
    }
}

fn lock_timers(table: &TimerTable) -> MutexGuard<'_, Vec<Timer>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Disabling drops the callback right away, releasing whatever it owns.
/// A timer disabled from inside its own tick is dropped when the tick ends.
struct HeadlessTimer {
    enabled: Arc<AtomicBool>,
    table: Weak<TimerTable>,
}

impl TimerHandle for HeadlessTimer {
    fn disable(&mut self) {
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(table) = self.table.upgrade() {
            lock_timers(&table).retain(Timer::is_enabled);
        }
    }
}

impl std::fmt::Debug for HeadlessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessHost")
            .field("regions", &self.regions())
            .field("timers", &self.active_timers())
            .finish()
    }
}
