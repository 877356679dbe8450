//! Hot-path pipe access.
//!
//! Every operation here runs under the device fast lock after verifying that
//! the endpoint owns the pipe it names. [`with_pipe`] is the only way to get
//! at a pipe through an endpoint.

use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::collab::{
    EventNotify, FlowOffMode, Owner, Platform, RegisterEvent, SatelliteInfo,
    TimerOp, TimerResult,
};
use crate::device::{Device, PipeTable};
use crate::driver::Driver;
use crate::endpoint::Endpoint;
use crate::error::BamError;
use crate::iovec::{self, Iovec, IovecFlags};
use crate::props::BamBase;

/// Proof that the fast lock is held and the endpoint owns `pipe`.
pub(crate) struct PipeAccess<'a, M: RawMutex> {
    device: &'a Device<M>,
    _table: &'a PipeTable,
    pipe: u32,
}

impl<M: RawMutex> PipeAccess<'_, M> {
    pub(crate) fn base(&self) -> &BamBase {
        self.device.base()
    }

    pub(crate) fn pipe(&self) -> u32 {
        self.pipe
    }
}

/// Run `f` with the endpoint's pipe locked and its ownership verified.
///
/// Fails with `NotConnected` when the endpoint has no device and with
/// `OwnershipViolation` when the device's pipe table does not name the
/// endpoint at its pipe index. The lock is released on every path.
pub(crate) fn with_pipe<M, R>(
    ep: &Endpoint<M>,
    f: impl for<'g> FnOnce(PipeAccess<'g, M>) -> Result<R, BamError>,
) -> Result<R, BamError>
where
    M: RawMutex,
{
    let Some(device) = ep.device() else {
        error!("pipe access: endpoint {} is not connected", ep.id().get());
        return Err(BamError::NotConnected);
    };
    let pipe = ep.pipe_index();
    device.with_pipes(|table| {
        if !table.is_owner(pipe, ep.id()) {
            error!(
                "pipe access: endpoint {} does not own pipe {} of {:#x}",
                ep.id().get(),
                pipe,
                device.phys_addr()
            );
            return Err(BamError::OwnershipViolation);
        }
        f(PipeAccess { device: &**device, _table: table, pipe })
    })
}

impl<M: RawMutex, P: Platform> Driver<M, P> {
    /// Log against the endpoint's device. Called outside the fast lock.
    fn ep_log(&self, ep: &Endpoint<M>, level: usize, args: fmt::Arguments<'_>) {
        if let Some(device) = ep.device() {
            self.dev_log(device, level, args);
        }
    }

    pub fn register_event(
        &self,
        ep: &Endpoint<M>,
        reg: &RegisterEvent,
    ) -> Result<(), BamError> {
        self.ensure_ready()?;
        let opts = reg.options.bits();
        self.ep_log(ep, 2, format_args!("register_event {:#x}", opts));
        let result = with_pipe(ep, |acc| {
            self.platform().reg_event(acc.base(), acc.pipe(), reg)
        });
        if let Err(e) = result {
            error!("register_event on pipe {} failed: {}", ep.pipe_index(), e);
        }
        result
    }

    /// Resume a halted pipe.
    pub fn flow_on(&self, ep: &Endpoint<M>) -> Result<(), BamError> {
        self.ensure_ready()?;
        self.ep_log(ep, 2, format_args!("flow_on {}", ep.pipe_index()));
        with_pipe(ep, |acc| {
            self.platform().halt(acc.base(), acc.pipe(), false);
            Ok(())
        })
    }

    /// Halt a pipe.
    pub fn flow_off(
        &self,
        ep: &Endpoint<M>,
        mode: FlowOffMode,
    ) -> Result<(), BamError> {
        self.ensure_ready()?;
        trace!("flow_off {:?}", mode);
        self.ep_log(ep, 2, format_args!("flow_off {}", ep.pipe_index()));
        with_pipe(ep, |acc| {
            self.platform().halt(acc.base(), acc.pipe(), true);
            Ok(())
        })
    }

    /// Submit a batch of descriptors.
    ///
    /// The whole batch is validated before the pipe is locked; a rejected
    /// batch submits nothing.
    pub fn transfer(
        &self,
        ep: &Endpoint<M>,
        batch: &[Iovec],
    ) -> Result<(), BamError> {
        self.ensure_ready()?;
        iovec::admit(batch)?;
        self.ep_log(ep, 0, format_args!("transfer {}", batch.len()));
        with_pipe(ep, |acc| {
            self.platform().transfer(acc.base(), acc.pipe(), batch)
        })
    }

    /// Submit a single descriptor.
    pub fn transfer_one(
        &self,
        ep: &Endpoint<M>,
        addr: u64,
        size: u32,
        user: usize,
        flags: IovecFlags,
    ) -> Result<(), BamError> {
        self.ensure_ready()?;
        if let Err(rule) = iovec::check_flags(flags) {
            error!("transfer_one rejected: {:?}", rule);
            return Err(BamError::InvalidDescriptor);
        }
        self.ep_log(ep, 0, format_args!("transfer_one {}", size));
        with_pipe(ep, |acc| {
            self.platform()
                .transfer_one(acc.base(), acc.pipe(), addr, size, user, flags)
        })
    }

    /// Read the next queued event, if any.
    pub fn get_event(
        &self,
        ep: &Endpoint<M>,
    ) -> Result<Option<EventNotify>, BamError> {
        self.ensure_ready()?;
        with_pipe(ep, |acc| self.platform().get_event(acc.base(), acc.pipe()))
    }

    /// Read the next completed descriptor, if any.
    pub fn get_iovec(
        &self,
        ep: &Endpoint<M>,
    ) -> Result<Option<Iovec>, BamError> {
        self.ensure_ready()?;
        with_pipe(ep, |acc| self.platform().get_iovec(acc.base(), acc.pipe()))
    }

    pub fn is_pipe_empty(&self, ep: &Endpoint<M>) -> Result<bool, BamError> {
        self.ensure_ready()?;
        with_pipe(ep, |acc| self.platform().is_empty(acc.base(), acc.pipe()))
    }

    /// Number of descriptors that can still be queued.
    pub fn get_free_count(&self, ep: &Endpoint<M>) -> Result<u32, BamError> {
        self.ensure_ready()?;
        with_pipe(ep, |acc| self.platform().free_count(acc.base(), acc.pipe()))
    }

    pub fn get_unused_desc_num(
        &self,
        ep: &Endpoint<M>,
    ) -> Result<u32, BamError> {
        self.ensure_ready()?;
        with_pipe(ep, |acc| {
            self.platform().unused_desc_count(acc.base(), acc.pipe())
        })
    }

    pub fn timer_ctrl(
        &self,
        ep: &Endpoint<M>,
        op: &TimerOp,
    ) -> Result<TimerResult, BamError> {
        self.ensure_ready()?;
        with_pipe(ep, |acc| {
            self.platform().timer_ctrl(acc.base(), acc.pipe(), op)
        })
    }

    /// Hand control of the pipe to a remote processor.
    ///
    /// Only [`Owner::Remote`] is supported. Returns the pipe address the
    /// remote side should use.
    pub fn set_owner(
        &self,
        ep: &Endpoint<M>,
        owner: Owner,
    ) -> Result<SatelliteInfo, BamError> {
        self.ensure_ready()?;
        if owner != Owner::Remote {
            error!("set_owner: unsupported owner {:?}", owner);
            return Err(BamError::InvalidArgument);
        }
        let conn = ep.connection();
        self.ep_log(ep, 0, format_args!("set_owner {}", ep.pipe_index()));
        with_pipe(ep, |acc| {
            self.platform().set_satellite(acc.base(), acc.pipe())?;
            let map = conn.map.as_ref().ok_or(BamError::CorruptState)?;
            let end = map.end(conn.mode());
            Ok(SatelliteInfo {
                bam_phys: end.bam_phys,
                pipe_index: end.pipe_index,
            })
        })
    }
}
