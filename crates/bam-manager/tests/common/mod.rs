#![allow(dead_code)]

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bam_manager::{
    BamBase, BamError, BamOptions, BamProperties, ConnectConfig,
    ConnectOptions, Connection, ConnectionMap, DeviceHandle, Driver,
    DriverConfig, DumpAction, Endpoint, EventNotify, Iovec, IovecFlags,
    LogChannelId, LogSink, ManageFlags, MemoryAllocator, PipeAddr,
    PipeEngine, PipeMode, PipeState, RegisterEvent, ResourceManager,
    TimerOp, TimerResult,
};
use critical_section as _;
use embassy_sync::blocking_mutex::raw::{NoopRawMutex, RawMutex};

pub const PHYS: u64 = 0x0790_4000;
pub const PHYS_B: u64 = 0x0798_4000;
/// Pipes the mock hardware reports at device init.
pub const HW_PIPES: u32 = 20;
const VIRT_OFFSET: usize = 0x4000_0000;
const REGION_BASE: u64 = 0x2000_0000;

// ---------------------------------------------------------------------------
// Mock platform
// ---------------------------------------------------------------------------

/// Everything the driver asked the platform to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RmInit(u32),
    Map(u64),
    Unmap(usize),
    DeviceInit(u64),
    DeviceDeinit(u64),
    ResetDevice(u64),
    CheckIrq(u64),
    DmaAttach(u64),
    DmaDetach(u64),
    ReleaseDescCache(u32),
    StateChange(PipeState),
    Transfer { pipe: u32, count: usize },
    TransferOne { pipe: u32, size: u32 },
    RegEvent(u32),
    Halt { pipe: u32, halt: bool },
    Reset(u32),
    Disable(u32),
    SetParams(u32, ConnectOptions),
    Satellite(u32),
    Timer(u32),
    InjectZlt(u32),
    Dump(DumpAction),
    AllocRegion(u32),
    FreeRegion(u64),
}

/// Failure switches shared with the test body.
#[derive(Clone, Default)]
pub struct FailFlags {
    pub rm_init: Arc<AtomicBool>,
    pub allocate: Arc<AtomicBool>,
    pub configure: Arc<AtomicBool>,
    pub disconnect: Arc<AtomicBool>,
    pub device_init: Arc<AtomicBool>,
    pub map: Arc<AtomicBool>,
    pub dma_attach: Arc<AtomicBool>,
    pub alloc_region: Arc<AtomicBool>,
}

pub fn arm(flag: &Arc<AtomicBool>) {
    flag.store(true, Ordering::SeqCst);
}

pub fn disarm(flag: &Arc<AtomicBool>) {
    flag.store(false, Ordering::SeqCst);
}

fn armed(flag: &Arc<AtomicBool>) -> bool {
    flag.load(Ordering::SeqCst)
}

pub struct MockPlatform {
    fail: FailFlags,
    calls: Mutex<Vec<Call>>,
    channels: Mutex<Vec<(LogChannelId, String)>>,
    lines: Mutex<Vec<(LogChannelId, String)>>,
    next_channel: AtomicU32,
    next_region: AtomicU64,
    completed: Mutex<VecDeque<Iovec>>,
    events: Mutex<VecDeque<EventNotify>>,
}

impl MockPlatform {
    pub fn new() -> (Self, FailFlags) {
        let fail = FailFlags::default();
        let platform = Self {
            fail: fail.clone(),
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            lines: Mutex::new(Vec::new()),
            next_channel: AtomicU32::new(1),
            next_region: AtomicU64::new(REGION_BASE),
            completed: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
        };
        (platform, fail)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn dumps(&self) -> Vec<DumpAction> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Dump(a) => Some(*a),
                _ => None,
            })
            .collect()
    }

    /// Names of the log channels currently open.
    pub fn open_channels(&self) -> Vec<String> {
        let channels = self.channels.lock().unwrap();
        channels.iter().map(|(_, name)| name.clone()).collect()
    }

    /// Lines written to the channel called `name`.
    pub fn lines_of(&self, name: &str) -> Vec<String> {
        let channels = self.channels.lock().unwrap();
        let Some((id, _)) = channels.iter().find(|(_, n)| n == name) else {
            return Vec::new();
        };
        let lines = self.lines.lock().unwrap();
        lines
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn push_completed(&self, iovec: Iovec) {
        self.completed.lock().unwrap().push_back(iovec);
    }

    pub fn push_event(&self, event: EventNotify) {
        self.events.lock().unwrap().push_back(event);
    }
}

impl PipeEngine for MockPlatform {
    fn device_init(
        &self,
        base: &BamBase,
        _props: &BamProperties,
    ) -> Result<u32, BamError> {
        self.record(Call::DeviceInit(base.phys_addr));
        if armed(&self.fail.device_init) {
            return Err(BamError::Failure);
        }
        Ok(HW_PIPES)
    }

    fn device_deinit(&self, base: &BamBase) {
        self.record(Call::DeviceDeinit(base.phys_addr));
    }

    fn reset_device(&self, base: &BamBase) -> Result<(), BamError> {
        self.record(Call::ResetDevice(base.phys_addr));
        Ok(())
    }

    fn check_irq(&self, base: &BamBase) -> Result<(), BamError> {
        self.record(Call::CheckIrq(base.phys_addr));
        Ok(())
    }

    fn dma_attach(&self, base: &BamBase) -> Result<(), BamError> {
        self.record(Call::DmaAttach(base.phys_addr));
        if armed(&self.fail.dma_attach) {
            return Err(BamError::Failure);
        }
        Ok(())
    }

    fn dma_detach(&self, base: &BamBase) {
        self.record(Call::DmaDetach(base.phys_addr));
    }

    fn release_desc_cache(&self, _base: &BamBase, pipe: u32) {
        self.record(Call::ReleaseDescCache(pipe));
    }

    fn transfer(
        &self,
        _base: &BamBase,
        pipe: u32,
        batch: &[Iovec],
    ) -> Result<(), BamError> {
        self.record(Call::Transfer { pipe, count: batch.len() });
        Ok(())
    }

    fn transfer_one(
        &self,
        _base: &BamBase,
        pipe: u32,
        _addr: u64,
        size: u32,
        _user: usize,
        _flags: IovecFlags,
    ) -> Result<(), BamError> {
        self.record(Call::TransferOne { pipe, size });
        Ok(())
    }

    fn get_event(
        &self,
        _base: &BamBase,
        _pipe: u32,
    ) -> Result<Option<EventNotify>, BamError> {
        Ok(self.events.lock().unwrap().pop_front())
    }

    fn get_iovec(
        &self,
        _base: &BamBase,
        _pipe: u32,
    ) -> Result<Option<Iovec>, BamError> {
        Ok(self.completed.lock().unwrap().pop_front())
    }

    fn reg_event(
        &self,
        _base: &BamBase,
        pipe: u32,
        _reg: &RegisterEvent,
    ) -> Result<(), BamError> {
        self.record(Call::RegEvent(pipe));
        Ok(())
    }

    fn halt(&self, _base: &BamBase, pipe: u32, halt: bool) {
        self.record(Call::Halt { pipe, halt });
    }

    fn reset(&self, _base: &BamBase, pipe: u32) -> Result<(), BamError> {
        self.record(Call::Reset(pipe));
        Ok(())
    }

    fn disable(&self, _base: &BamBase, pipe: u32) -> Result<(), BamError> {
        self.record(Call::Disable(pipe));
        Ok(())
    }

    fn set_params(
        &self,
        _base: &BamBase,
        pipe: u32,
        options: ConnectOptions,
    ) -> Result<(), BamError> {
        self.record(Call::SetParams(pipe, options));
        Ok(())
    }

    fn set_satellite(
        &self,
        _base: &BamBase,
        pipe: u32,
    ) -> Result<(), BamError> {
        self.record(Call::Satellite(pipe));
        Ok(())
    }

    fn timer_ctrl(
        &self,
        _base: &BamBase,
        pipe: u32,
        op: &TimerOp,
    ) -> Result<TimerResult, BamError> {
        self.record(Call::Timer(pipe));
        let current_ms = match op {
            TimerOp::Read => 42,
            _ => 0,
        };
        Ok(TimerResult { current_ms })
    }

    fn pending_desc(
        &self,
        _base: &BamBase,
        _pipe: u32,
    ) -> Result<bool, BamError> {
        Ok(false)
    }

    fn is_empty(&self, _base: &BamBase, _pipe: u32) -> Result<bool, BamError> {
        Ok(self.completed.lock().unwrap().is_empty())
    }

    fn free_count(&self, _base: &BamBase, _pipe: u32) -> Result<u32, BamError> {
        Ok(16)
    }

    fn unused_desc_count(
        &self,
        _base: &BamBase,
        _pipe: u32,
    ) -> Result<u32, BamError> {
        Ok(15)
    }

    fn inject_zlt(&self, _base: &BamBase, pipe: u32) -> Result<(), BamError> {
        self.record(Call::InjectZlt(pipe));
        Ok(())
    }

    fn dump(&self, _base: &BamBase, action: &DumpAction) {
        self.record(Call::Dump(*action));
    }
}

impl ResourceManager for MockPlatform {
    fn init(&self, options: u32) -> Result<(), BamError> {
        self.record(Call::RmInit(options));
        if armed(&self.fail.rm_init) {
            return Err(BamError::Failure);
        }
        Ok(())
    }

    fn state_change(
        &self,
        base: &BamBase,
        conn: &mut Connection,
        target: PipeState,
    ) -> Result<(), BamError> {
        self.record(Call::StateChange(target));
        match target {
            PipeState::Allocated => {
                if armed(&self.fail.allocate) {
                    return Err(BamError::ResourceExhausted);
                }
                let config = conn.config;
                let pipe = match config.mode {
                    PipeMode::Source => config.src_pipe_index,
                    PipeMode::Destination => config.dest_pipe_index,
                };
                let here =
                    PipeAddr { bam_phys: base.phys_addr, pipe_index: pipe };
                let (src, dest) = match config.mode {
                    PipeMode::Source => (here, PipeAddr::default()),
                    PipeMode::Destination => (PipeAddr::default(), here),
                };
                let map = Arc::new(ConnectionMap::new(src, dest));
                map.bind(config.mode, conn.id());
                conn.pipe_index = pipe;
                conn.map = Some(map);
                Ok(())
            }
            PipeState::Connected => {
                if armed(&self.fail.configure) {
                    return Err(BamError::Failure);
                }
                Ok(())
            }
            PipeState::Disconnected => {
                if armed(&self.fail.disconnect) {
                    return Err(BamError::Failure);
                }
                if let Some(map) = &conn.map {
                    map.unbind(conn.mode(), conn.id());
                }
                Ok(())
            }
        }
    }
}

impl MemoryAllocator for MockPlatform {
    fn map_physical(&self, phys: u64, _size: u32) -> Result<usize, BamError> {
        self.record(Call::Map(phys));
        if armed(&self.fail.map) {
            return Err(BamError::ResourceExhausted);
        }
        Ok(VIRT_OFFSET + phys as usize)
    }

    fn unmap(&self, virt: usize, _size: u32) {
        self.record(Call::Unmap(virt));
    }

    fn alloc_region(&self, size: u32) -> Result<u64, BamError> {
        self.record(Call::AllocRegion(size));
        if armed(&self.fail.alloc_region) {
            return Err(BamError::ResourceExhausted);
        }
        Ok(self.next_region.fetch_add(u64::from(size), Ordering::SeqCst))
    }

    fn free_region(&self, phys: u64, _size: u32) {
        self.record(Call::FreeRegion(phys));
    }

    fn region_ptr(&self, phys: u64) -> usize {
        VIRT_OFFSET + phys as usize
    }
}

impl LogSink for MockPlatform {
    fn create(&self, name: &str) -> Option<LogChannelId> {
        let id = LogChannelId(self.next_channel.fetch_add(1, Ordering::SeqCst));
        self.channels.lock().unwrap().push((id, name.to_string()));
        Some(id)
    }

    fn destroy(&self, id: LogChannelId) {
        self.channels.lock().unwrap().retain(|(i, _)| *i != id);
    }

    fn write(&self, id: LogChannelId, args: fmt::Arguments<'_>) {
        self.lines.lock().unwrap().push((id, args.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub type TestDriver = Driver<NoopRawMutex, MockPlatform>;
pub type TestEndpoint = Endpoint<NoopRawMutex>;

/// Properties of a locally managed BAM that needs mapping.
pub fn props(phys_addr: u64) -> BamProperties {
    BamProperties {
        phys_addr,
        virt_addr: None,
        virt_size: 0x2_0000,
        irq: 10,
        num_pipes: 0,
        ee: 0,
        manage: ManageFlags::empty(),
        options: BamOptions::empty(),
        summing_threshold: 0x10,
        event_threshold: 0x10,
        restricted_pipes: 0,
        ipc_loglevel: 0,
    }
}

/// A driver that has not been initialized yet.
pub fn make_driver_on<M: RawMutex>(
    config: DriverConfig,
) -> (Driver<M, MockPlatform>, FailFlags) {
    let (platform, fail) = MockPlatform::new();
    (Driver::new(platform, config), fail)
}

/// A ready driver with no devices.
pub fn make_driver() -> (TestDriver, FailFlags) {
    let (mut driver, fail) = make_driver_on(DriverConfig::default());
    driver.init().unwrap();
    (driver, fail)
}

/// A ready driver with one device registered at [`PHYS`].
pub fn make_driver_with_device() -> (TestDriver, DeviceHandle, FailFlags) {
    let (driver, fail) = make_driver();
    let handle = driver.register_device(&props(PHYS)).unwrap();
    (driver, handle, fail)
}

/// Source-mode descriptor for `pipe` of `handle`, draining into memory.
pub fn src_config(handle: DeviceHandle, pipe: u32) -> ConnectConfig {
    ConnectConfig {
        mode: PipeMode::Source,
        source: handle,
        src_pipe_index: pipe,
        destination: DeviceHandle::MEMORY,
        ..ConnectConfig::unconfigured()
    }
}

pub fn connected<M: RawMutex>(
    driver: &Driver<M, MockPlatform>,
    handle: DeviceHandle,
    pipe: u32,
) -> Endpoint<M> {
    let mut ep = driver.alloc_endpoint().unwrap();
    driver.connect(&mut ep, &src_config(handle, pipe)).unwrap();
    ep
}
