use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt::{self, Write as _};
use core::num::NonZeroU32;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::collab::{LogChannelId, Platform};
use crate::debugfs::DebugFs;
use crate::device::Device;
use crate::dump::{self, DumpAction, DumpRequest};
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::BamError;
use crate::handle::DeviceHandle;
use crate::props::{
    BamBase, BamOptions, BamProperties, ManageFlags, MemBuffer, BAM_MAX_PIPES,
    IPC_DEFAULT_LOGLEVEL, IPC_DUMP_CHANNEL, IPC_LOG_CHANNELS,
};
use crate::registry::Registry;

/// Physical window from which bam-to-bam FIFOs are carved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeMemory {
    pub phys_base: u64,
    pub size: u32,
}

/// Driver-wide configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverConfig {
    /// Option bits handed to the resource manager at init.
    pub rm_options: u32,
    pub pipe_memory: Option<PipeMemory>,
    /// BAM-DMA device registered during [`Driver::init`].
    pub bamdma: Option<BamProperties>,
}

/// BAM driver context.
///
/// Owns the device registry and its global lock. Construct with
/// [`Driver::new`], call [`Driver::init`] before sharing it, and
/// [`Driver::shutdown`] once every device has been deregistered. Until
/// `init` completes every operation fails with [`BamError::NotReady`].
pub struct Driver<M: RawMutex, P: Platform> {
    platform: P,
    config: DriverConfig,
    registry: Mutex<M, RefCell<Registry<M>>>,
    pub(crate) debug: Mutex<M, RefCell<DebugFs>>,
    ready: AtomicBool,
    inconsistencies: AtomicU32,
    next_endpoint: AtomicU32,
    channels: [Option<LogChannelId>; IPC_LOG_CHANNELS],
    bamdma: Option<DeviceHandle>,
}

impl<M: RawMutex, P: Platform> Driver<M, P> {
    pub fn new(platform: P, config: DriverConfig) -> Self {
        Self {
            platform,
            config,
            registry: Mutex::new(RefCell::new(Registry::new())),
            debug: Mutex::new(RefCell::new(DebugFs::new())),
            ready: AtomicBool::new(false),
            inconsistencies: AtomicU32::new(0),
            next_endpoint: AtomicU32::new(0),
            channels: [None; IPC_LOG_CHANNELS],
            bamdma: None,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Number of inconsistencies detected so far: failed rollbacks,
    /// devices removed with pipes still owned, teardown with devices left.
    pub fn inconsistencies(&self) -> u32 {
        self.inconsistencies.load(Ordering::Relaxed)
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        self.registry.lock(|r| r.borrow().len())
    }

    /// Bring the driver up.
    pub fn init(&mut self) -> Result<(), BamError> {
        if self.is_ready() {
            return Ok(());
        }
        self.platform.init(self.config.rm_options).inspect_err(|e| {
            error!("resource manager init failed: {}", e);
        })?;

        for (n, slot) in self.channels.iter_mut().enumerate() {
            let mut name = heapless::String::<32>::new();
            let _ = write!(name, "bam_ipc_log{}", n);
            *slot = self.platform.create(&name);
            if slot.is_none() {
                debug!("no driver log channel {}", n);
            }
        }

        if let Some(props) = self.config.bamdma {
            let handle = self.register_device(&props).inspect_err(|e| {
                error!("BAM-DMA registration failed: {}", e);
            })?;
            self.bamdma = Some(handle);
        }

        self.ready.store(true, Ordering::Release);
        info!("BAM driver ready");
        Ok(())
    }

    /// Take the driver down.
    ///
    /// Devices still registered are left alone and reported as
    /// `InUse(n)`.
    pub fn shutdown(&mut self) -> Result<(), BamError> {
        self.ready.store(false, Ordering::Release);

        if let Some(handle) = self.bamdma.take() {
            if let Err(e) = self.remove_device(handle) {
                warn!("BAM-DMA deregistration failed: {}", e);
            }
        }

        for id in self.channels.iter_mut().filter_map(Option::take) {
            self.platform.destroy(id);
        }

        let remaining = self.device_count();
        if remaining > 0 {
            error!("shutdown with {} devices still registered", remaining);
            self.note_inconsistency();
            return Err(BamError::InUse(remaining));
        }
        Ok(())
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), BamError> {
        if self.is_ready() {
            Ok(())
        } else {
            trace!("driver is not ready");
            Err(BamError::NotReady)
        }
    }

    pub(crate) fn next_endpoint_id(&self) -> Option<EndpointId> {
        bump_endpoint_id(&self.next_endpoint)
    }

    pub(crate) fn note_inconsistency(&self) {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn registry<R>(
        &self,
        f: impl FnOnce(&mut Registry<M>) -> R,
    ) -> R {
        self.registry.lock(|r| f(&mut r.borrow_mut()))
    }

    pub(crate) fn resolve(
        &self,
        handle: DeviceHandle,
    ) -> Result<Arc<Device<M>>, BamError> {
        self.registry(|r| r.resolve(handle)).ok_or_else(|| {
            error!("no BAM for handle {:#x}", handle.raw());
            BamError::NotFound
        })
    }

    /// Write to a driver log channel and the debug record.
    pub(crate) fn log(&self, level: usize, args: fmt::Arguments<'_>) {
        if let Some(Some(id)) = self.channels.get(level) {
            self.platform.write(*id, args);
        }
        self.record(level, args);
    }

    /// Write to a device log channel and the debug record.
    pub(crate) fn dev_log(
        &self,
        dev: &Device<M>,
        level: usize,
        args: fmt::Arguments<'_>,
    ) {
        dev.log(&self.platform, level, args);
        self.record(level, args);
    }

    pub(crate) fn record(&self, level: usize, args: fmt::Arguments<'_>) {
        self.debug.lock(|d| d.borrow_mut().record(level, args));
    }

    /// Register a BAM and return its handle.
    ///
    /// Only a BAM-DMA device may be registered before the driver is ready.
    pub fn register_device(
        &self,
        props: &BamProperties,
    ) -> Result<DeviceHandle, BamError> {
        if !self.is_ready() && !props.options.contains(BamOptions::BAMDMA) {
            error!("register {:#x}: driver not ready", props.phys_addr);
            return Err(BamError::NotReady);
        }
        validate(props)?;

        let handle = self.registry(|reg| {
            if reg.find_phys(props.phys_addr).is_some() {
                error!("BAM {:#x} is already registered", props.phys_addr);
                return Err(BamError::AlreadyExists);
            }
            let handle = reg.vacant()?;
            let device = self.build_device(handle, props)?;
            reg.insert(Arc::new(device));
            Ok(handle)
        })?;

        if props.options.contains(BamOptions::BAMDMA) {
            let device = self.resolve(handle)?;
            if let Err(e) = self.platform.dma_attach(device.base()) {
                error!("BAM-DMA init failed for {:#x}", props.phys_addr);
                device.with_config(|c| c.options.remove(BamOptions::BAMDMA));
                if let Err(unwind) = self.remove_device(handle) {
                    error!(
                        "BAM-DMA unwind failed for {:#x}: {}",
                        props.phys_addr, unwind
                    );
                    self.note_inconsistency();
                }
                return Err(e);
            }
        }

        info!("BAM {:#x} registered", props.phys_addr);
        self.log(3, format_args!("BAM {:#x} registered", props.phys_addr));
        Ok(handle)
    }

    /// Map, initialize and wrap a device. Nothing is left behind on failure.
    fn build_device(
        &self,
        handle: DeviceHandle,
        props: &BamProperties,
    ) -> Result<Device<M>, BamError> {
        let local = props.manage.has_local_access();
        let mut mapped = None;
        let virt_addr = match props.virt_addr {
            Some(v) => v,
            None if local => {
                let v = self
                    .platform
                    .map_physical(props.phys_addr, props.virt_size)
                    .inspect_err(|_| {
                        error!(
                            "unable to map BAM {:#x} size {:#x}",
                            props.phys_addr,
                            props.virt_size
                        );
                    })?;
                mapped = Some(v);
                v
            }
            None => 0,
        };

        let mut channels = [None; IPC_LOG_CHANNELS];
        for (n, slot) in channels.iter_mut().enumerate() {
            let mut name = heapless::String::<32>::new();
            let _ = write!(name, "bam_{:x}_{}", props.phys_addr, n);
            *slot = self.platform.create(&name);
            if slot.is_none() {
                debug!("no log channel {} for BAM {:#x}", n, props.phys_addr);
            }
        }

        let mut base = BamBase {
            phys_addr: props.phys_addr,
            virt_addr,
            virt_size: props.virt_size,
            num_pipes: props.num_pipes,
            ee: props.ee,
        };
        let hw_pipes = match self.platform.device_init(&base, props) {
            Ok(n) => n,
            Err(e) => {
                error!("failed to init BAM {:#x}: {}", props.phys_addr, e);
                for id in channels.into_iter().flatten() {
                    self.platform.destroy(id);
                }
                if let Some(v) = mapped {
                    self.platform.unmap(v, props.virt_size);
                }
                return Err(e);
            }
        };
        if base.num_pipes == 0 {
            base.num_pipes = hw_pipes.min(BAM_MAX_PIPES as u32);
        }

        let mut stored = *props;
        stored.virt_addr = Some(virt_addr);
        stored.num_pipes = base.num_pipes;
        let log_level = match props.ipc_loglevel {
            0 => IPC_DEFAULT_LOGLEVEL,
            n => n,
        };
        Ok(Device::new(handle, base, stored, mapped, channels, log_level))
    }

    /// Deregister a BAM.
    ///
    /// The device leaves the registry before any of its resources are
    /// released. Pipes still owned at this point are reported as an
    /// inconsistency and their endpoints lose access.
    pub fn deregister_device(
        &self,
        handle: DeviceHandle,
    ) -> Result<(), BamError> {
        self.ensure_ready()?;
        self.remove_device(handle)
    }

    fn remove_device(&self, handle: DeviceHandle) -> Result<(), BamError> {
        let device = self
            .registry(|r| r.remove(handle))
            .ok_or(BamError::NotFound)?;
        let base = *device.base();
        debug!("deregister BAM {:#x}", base.phys_addr);

        // Retire under the sleep lock so no connect can claim a pipe after.
        let stranded = device.with_config(|_| device.retire());
        if stranded > 0 {
            error!(
                "BAM {:#x} deregistered with {} pipes still connected",
                base.phys_addr,
                stranded
            );
            self.note_inconsistency();
        }

        let dma = device.with_config(|c| {
            let attached = c.options.contains(BamOptions::BAMDMA);
            c.options.remove(BamOptions::BAMDMA);
            attached
        });
        if dma {
            self.platform.dma_detach(&base);
        }

        if device.props().options.contains(BamOptions::HOLD_MEM) {
            for pipe in 0..base.num_pipes {
                self.platform.release_desc_cache(&base, pipe);
            }
        }

        device.with_config(|_| self.platform.device_deinit(&base));
        for id in device.channels().iter().flatten() {
            self.platform.destroy(*id);
        }
        if let Some(v) = device.mapped() {
            self.platform.unmap(v, base.virt_size);
        }
        self.log(3, format_args!("BAM {:#x} deregistered", base.phys_addr));
        Ok(())
    }

    /// Handle of the device registered at `phys_addr`.
    pub fn phys_to_handle(
        &self,
        phys_addr: u64,
    ) -> Result<DeviceHandle, BamError> {
        self.ensure_ready()?;
        self.registry(|r| r.find_phys(phys_addr))
            .map(|d| d.handle())
            .ok_or_else(|| {
                error!("no BAM at {:#x}", phys_addr);
                BamError::NotFound
            })
    }

    /// Reset a device under the global and device locks.
    pub fn device_reset(&self, handle: DeviceHandle) -> Result<(), BamError> {
        self.ensure_ready()?;
        if handle == DeviceHandle::INVALID {
            return Err(BamError::InvalidArgument);
        }
        self.registry(|r| {
            let device = r.resolve(handle).ok_or(BamError::NotFound)?;
            device
                .with_config(|_| self.platform.reset_device(device.base()))
                .inspect_err(|_| {
                    error!("failed to reset BAM {:#x}", device.phys_addr());
                })
        })
    }

    /// Run `f` on a raw pipe of a device, under the device fast lock.
    fn with_raw_pipe<R>(
        &self,
        handle: DeviceHandle,
        pipe: u32,
        f: impl FnOnce(&BamBase) -> Result<R, BamError>,
    ) -> Result<R, BamError> {
        self.ensure_ready()?;
        if pipe as usize >= BAM_MAX_PIPES {
            error!("pipe {} out of range", pipe);
            return Err(BamError::InvalidArgument);
        }
        let device = self.resolve(handle)?;
        device.with_pipes(|_| f(device.base()))
    }

    pub fn pipe_reset(
        &self,
        handle: DeviceHandle,
        pipe: u32,
    ) -> Result<(), BamError> {
        self.with_raw_pipe(handle, pipe, |b| self.platform.reset(b, pipe))
    }

    pub fn pipe_disable(
        &self,
        handle: DeviceHandle,
        pipe: u32,
    ) -> Result<(), BamError> {
        self.with_raw_pipe(handle, pipe, |b| self.platform.disable(b, pipe))
    }

    /// Whether the pipe still has descriptors in flight.
    pub fn pipe_pending_desc(
        &self,
        handle: DeviceHandle,
        pipe: u32,
    ) -> Result<bool, BamError> {
        self.with_raw_pipe(handle, pipe, |b| {
            self.platform.pending_desc(b, pipe)
        })
    }

    pub fn pipe_inject_zlt(
        &self,
        handle: DeviceHandle,
        pipe: u32,
    ) -> Result<(), BamError> {
        self.with_raw_pipe(handle, pipe, |b| self.platform.inject_zlt(b, pipe))
    }

    /// Service pending interrupt work for a device that runs polled.
    pub fn process_irq(&self, handle: DeviceHandle) -> Result<(), BamError> {
        self.ensure_ready()?;
        let device = self.resolve(handle)?;
        device.with_pipes(|_| self.platform.check_irq(device.base()))
    }

    /// Physical base and mapped size of a device.
    pub fn bam_addr(
        &self,
        handle: DeviceHandle,
    ) -> Result<(u64, u32), BamError> {
        self.ensure_ready()?;
        let device = self.resolve(handle)?;
        Ok((device.phys_addr(), device.base().virt_size))
    }

    /// Dump registers and FIFOs of a device as selected by `req`.
    ///
    /// Returns the actions that were performed. Undefined option codes
    /// perform nothing and succeed.
    pub fn bam_debug_info(
        &self,
        handle: DeviceHandle,
        req: &DumpRequest,
    ) -> Result<Vec<DumpAction>, BamError> {
        self.ensure_ready()?;
        if handle == DeviceHandle::INVALID {
            return Err(BamError::InvalidArgument);
        }
        let device = self.resolve(handle)?;
        Ok(self.run_dump(&device, req))
    }

    pub(crate) fn run_dump(
        &self,
        device: &Device<M>,
        req: &DumpRequest,
    ) -> Vec<DumpAction> {
        let base = device.base();
        if let Some(id) = device.channels()[IPC_DUMP_CHANNEL] {
            self.platform
                .write(id, format_args!("dump BAM {:#x}", base.phys_addr));
        }
        let actions = dump::plan(req, base.num_pipes, base.ee);
        if actions.is_empty() {
            info!("dump option {} selects nothing", req.option);
        }
        for action in &actions {
            if *action == DumpAction::TestBusSelectorMissing {
                warn!("test bus selector should not be zero");
            }
            self.platform.dump(base, action);
        }
        actions
    }

    /// Reserve pipe memory.
    pub fn alloc_mem(
        &self,
        ep: Option<&Endpoint<M>>,
        size: u32,
    ) -> Result<MemBuffer, BamError> {
        self.ensure_ready()?;
        if size == 0 {
            error!("alloc_mem: zero size");
            return Err(BamError::InvalidArgument);
        }
        match ep {
            Some(ep) => debug!("alloc_mem for pipe {}", ep.pipe_index()),
            None => debug!("alloc_mem before pipe setup"),
        }
        let phys_base = self.platform.alloc_region(size).inspect_err(|_| {
            error!("alloc_mem: {} bytes unavailable", size);
        })?;
        Ok(MemBuffer {
            phys_base,
            base: self.platform.region_ptr(phys_base),
            size,
        })
    }

    /// Release pipe memory obtained from [`Driver::alloc_mem`].
    pub fn free_mem(
        &self,
        ep: Option<&Endpoint<M>>,
        buf: &MemBuffer,
    ) -> Result<(), BamError> {
        self.ensure_ready()?;
        if buf.phys_base == 0 || buf.is_empty() {
            error!("free_mem: invalid buffer");
            return Err(BamError::InvalidArgument);
        }
        if let Some(ep) = ep {
            debug!("free_mem for pipe {}", ep.pipe_index());
        }
        self.platform.free_region(buf.phys_base, buf.size);
        Ok(())
    }

    /// Carve a bam-to-bam FIFO out of the configured pipe memory.
    ///
    /// With `use_offset`, `addr` is an offset into the window; otherwise
    /// it is a physical address inside it.
    pub fn setup_bam2bam_fifo(
        &self,
        addr: u64,
        size: u32,
        use_offset: bool,
    ) -> Result<MemBuffer, BamError> {
        if size == 0 {
            error!("setup_bam2bam_fifo: zero size");
            return Err(BamError::InvalidArgument);
        }
        self.ensure_ready()?;
        let window = self.config.pipe_memory.ok_or(BamError::InvalidArgument)?;
        let window_end = window.phys_base + u64::from(window.size);

        let phys_base = if use_offset {
            let end = addr.checked_add(u64::from(size));
            match end {
                Some(end) if end <= u64::from(window.size) => {
                    window.phys_base + addr
                }
                _ => return Err(out_of_range()),
            }
        } else {
            let end = addr.checked_add(u64::from(size));
            match end {
                Some(end) if addr >= window.phys_base && end <= window_end => {
                    addr
                }
                _ => return Err(out_of_range()),
            }
        };

        Ok(MemBuffer {
            phys_base,
            base: self.platform.region_ptr(phys_base),
            size,
        })
    }
}

fn out_of_range() -> BamError {
    error!("requested memory is outside the pipe memory window");
    BamError::InvalidArgument
}

fn validate(props: &BamProperties) -> Result<(), BamError> {
    if props.num_pipes as usize > BAM_MAX_PIPES {
        error!("BAM {:#x}: too many pipes", props.phys_addr);
        return Err(BamError::InvalidArgument);
    }
    if props.manage.has_local_access()
        && props.virt_addr.is_none()
        && props.virt_size == 0
    {
        error!("invalid properties for BAM {:#x}", props.phys_addr);
        return Err(BamError::InvalidArgument);
    }
    if !props.manage.contains(ManageFlags::DEVICE_REMOTE)
        && props.summing_threshold == 0
    {
        error!("invalid control properties for BAM {:#x}", props.phys_addr);
        return Err(BamError::InvalidArgument);
    }
    Ok(())
}

/// Next endpoint id from `counter`. Ids are never reused; once `u32::MAX`
/// has been handed out the counter stays exhausted.
fn bump_endpoint_id(counter: &AtomicU32) -> Option<EndpointId> {
    let prev = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            n.checked_add(1)
        })
        .ok()?;
    NonZeroU32::new(prev + 1).map(EndpointId::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ids_stop_at_the_top_of_the_range() {
        let counter = AtomicU32::new(0);
        assert_eq!(bump_endpoint_id(&counter).map(|id| id.get()), Some(1));

        let counter = AtomicU32::new(u32::MAX - 1);
        assert_eq!(
            bump_endpoint_id(&counter).map(|id| id.get()),
            Some(u32::MAX)
        );
        assert_eq!(bump_endpoint_id(&counter), None);
        assert_eq!(bump_endpoint_id(&counter), None);
        assert_eq!(counter.load(Ordering::Relaxed), u32::MAX);
    }
}
