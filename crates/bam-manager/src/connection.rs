//! Endpoint lifecycle and the connect/disconnect state machine.
//!
//! ```text
//! Disconnected --allocate--> Allocated --configure--> Connected
//!      ^                         |                        |
//!      +-------- disconnect -----+------------------------+
//! ```
//!
//! A configure failure rolls back through `disconnect` so the endpoint
//! always ends `Disconnected` or `Connected`.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::access::with_pipe;
use crate::collab::Platform;
use crate::driver::Driver;
use crate::endpoint::{ConnectConfig, Endpoint, PipeMode, PipeState};
use crate::error::BamError;

enum Failure {
    /// Resources could not be reserved; nothing to undo.
    Allocate(BamError),
    /// Resources are reserved and must be released.
    Configure(BamError),
}

impl<M: RawMutex, P: Platform> Driver<M, P> {
    /// Create a disconnected endpoint.
    pub fn alloc_endpoint(&self) -> Result<Endpoint<M>, BamError> {
        self.ensure_ready()?;
        let id = self.next_endpoint_id().ok_or(BamError::ResourceExhausted)?;
        let mut config = ConnectConfig::unconfigured();
        self.platform().config_init(&mut config);
        Ok(Endpoint::new(id, config))
    }

    /// Release an endpoint. It must be disconnected; otherwise it is
    /// handed back with the error.
    pub fn free_endpoint(
        &self,
        ep: Endpoint<M>,
    ) -> Result<(), (BamError, Endpoint<M>)> {
        if let Err(e) = self.ensure_ready() {
            return Err((e, ep));
        }
        if ep.state() != PipeState::Disconnected {
            error!("free_endpoint: endpoint {} is still in use", ep.id().get());
            return Err((BamError::InvalidArgument, ep));
        }
        Ok(())
    }

    /// Connect an endpoint as described by `config`.
    ///
    /// The target device is the source device in source mode and the
    /// destination device otherwise. If configuration fails after resources
    /// were reserved the endpoint is disconnected again and the
    /// configuration error is returned.
    pub fn connect(
        &self,
        ep: &mut Endpoint<M>,
        config: &ConnectConfig,
    ) -> Result<(), BamError> {
        self.ensure_ready()?;
        if !config.lock_group_valid() {
            error!("connect: invalid pipe lock group {}", config.lock_group);
            return Err(BamError::InvalidArgument);
        }
        if ep.state() != PipeState::Disconnected {
            error!("connect: endpoint {} is already in use", ep.id().get());
            return Err(BamError::InvalidArgument);
        }

        let target = config.target();
        let device = self.resolve(target)?;

        let outcome = device.with_config(|_| {
            // Deregistration retires the device under this lock.
            if device.is_retired() {
                return Err(Failure::Allocate(BamError::NotFound));
            }
            let mode = match config.mode {
                PipeMode::Source => "src",
                PipeMode::Destination => "dest",
            };
            self.dev_log(
                &device,
                2,
                format_args!(
                    "connect: bam {:#x} src {:#x} dest {:#x} mode {}",
                    device.phys_addr(),
                    config.source.raw(),
                    config.destination.raw(),
                    mode
                ),
            );

            let base = device.base();
            ep.connection_mut().config = *config;
            self.platform()
                .state_change(base, ep.connection_mut(), PipeState::Allocated)
                .map_err(Failure::Allocate)?;
            ep.attach(device.clone(), PipeState::Allocated);

            let (pipe, id) = (ep.pipe_index(), ep.id());
            device
                .with_pipes(|t| t.claim(pipe, id))
                .map_err(Failure::Configure)?;

            self.platform()
                .state_change(base, ep.connection_mut(), PipeState::Connected)
                .map_err(Failure::Configure)?;
            ep.set_state(PipeState::Connected);
            Ok(())
        });

        match outcome {
            Ok(()) => {
                debug!(
                    "endpoint {} connected to pipe {}",
                    ep.id().get(),
                    ep.pipe_index()
                );
                Ok(())
            }
            Err(Failure::Allocate(e)) => {
                error!("connect: allocation failed: {}", e);
                Err(e)
            }
            Err(Failure::Configure(e)) => {
                error!("connect: configuration failed: {}", e);
                if let Err(rollback) = self.teardown(ep) {
                    error!(
                        "connect: rollback of endpoint {} failed: {}",
                        ep.id().get(),
                        rollback
                    );
                    self.note_inconsistency();
                }
                Err(e)
            }
        }
    }

    /// Disconnect an endpoint and reset its connection descriptor.
    ///
    /// Fails with `InvalidArgument` for an endpoint that is not attached to
    /// a device and with `CorruptState` if the connection map does not name
    /// this endpoint for its role. If the device was deregistered in the
    /// meantime the resource manager is not called; the endpoint is released
    /// and the condition is counted as an inconsistency.
    pub fn disconnect(&self, ep: &mut Endpoint<M>) -> Result<(), BamError> {
        self.ensure_ready()?;
        self.teardown(ep)
    }

    fn teardown(&self, ep: &mut Endpoint<M>) -> Result<(), BamError> {
        let Some(device) = ep.device().cloned() else {
            error!("disconnect: endpoint {} has no device", ep.id().get());
            return Err(BamError::InvalidArgument);
        };

        let conn = ep.connection();
        let holder = conn.map.as_ref().and_then(|m| m.client(conn.mode()));
        if holder != Some(ep.id()) {
            error!(
                "disconnect: client context of endpoint {} is corrupt",
                ep.id().get()
            );
            return Err(BamError::CorruptState);
        }

        let retired = device.with_config(|_| {
            if device.is_retired() {
                return Ok(true);
            }
            self.dev_log(
                &device,
                2,
                format_args!(
                    "disconnect: bam {:#x} pipe {}",
                    device.phys_addr(),
                    ep.pipe_index()
                ),
            );
            self.platform().state_change(
                device.base(),
                ep.connection_mut(),
                PipeState::Disconnected,
            )?;
            let (pipe, id) = (ep.pipe_index(), ep.id());
            device.with_pipes(|t| t.release(pipe, id));
            Ok::<_, BamError>(false)
        })?;

        if retired {
            // The device is gone; only the bookkeeping can be undone.
            error!(
                "disconnect: BAM {:#x} was deregistered under endpoint {}",
                device.phys_addr(),
                ep.id().get()
            );
            self.note_inconsistency();
            let conn = ep.connection();
            if let Some(map) = &conn.map {
                map.unbind(conn.mode(), conn.id());
            }
        }

        self.platform().config_init(&mut ep.connection_mut().config);
        ep.detach();
        Ok(())
    }

    /// Copy of the endpoint's current connection descriptor.
    pub fn get_config(
        &self,
        ep: &Endpoint<M>,
    ) -> Result<ConnectConfig, BamError> {
        self.ensure_ready()?;
        Ok(*ep.config())
    }

    /// Apply new pipe options to a connected endpoint.
    ///
    /// Only the option bits are taken from `config`; they are stored once
    /// the pipe engine accepts them.
    pub fn set_config(
        &self,
        ep: &mut Endpoint<M>,
        config: &ConnectConfig,
    ) -> Result<(), BamError> {
        self.ensure_ready()?;
        let Some(device) = ep.device().cloned() else {
            error!("set_config: endpoint {} is not connected", ep.id().get());
            return Err(BamError::NotConnected);
        };
        let options = config.options;
        device.with_config(|_| {
            with_pipe(ep, |acc| {
                self.platform().set_params(acc.base(), acc.pipe(), options)
            })
        })?;
        ep.connection_mut().config.options = options;
        Ok(())
    }
}
