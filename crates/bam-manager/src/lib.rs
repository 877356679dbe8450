#![no_std]
//! Manager for shared BAM DMA engines and their pipes.
//!
//! Devices are registered into a driver-owned registry and addressed through
//! generation-checked handles. Clients allocate endpoints, connect them to a
//! pipe of a device and then submit transfers and read completions. Every
//! pipe access runs under the device's interrupt-safe fast lock after
//! checking that the endpoint still owns the pipe.
//!
//! Hardware register programming, physical pipe allocation, memory mapping
//! and log storage are supplied by the integrator through the traits in
//! [`Platform`].

extern crate alloc;

#[macro_use]
mod fmt;

mod access;
mod collab;
mod connection;
mod debugfs;
mod device;
mod driver;
mod dump;
mod endpoint;
mod error;
mod handle;
mod iovec;
mod props;
mod registry;

pub use collab::{
    EventKind, EventNotify, EventOptions, FlowOffMode, LogChannelId, LogSink,
    MemoryAllocator, Owner, PipeEngine, Platform, RegisterEvent,
    ResourceManager, SatelliteInfo, TimerOp, TimerResult,
};
pub use debugfs::{leading_decimal, DebugFile, MAX_MSG_LEN};
pub use driver::{Driver, DriverConfig, PipeMemory};
pub use dump::{plan, DumpAction, DumpRequest, TRAILING_DEPTH, TYPICAL_PIPES};
pub use endpoint::{
    ConnectConfig, ConnectOptions, Connection, ConnectionMap, Endpoint,
    EndpointId, PipeAddr, PipeMode, PipeState, LOCK_GROUP_UNSET,
    MAX_LOCK_GROUP,
};
pub use error::BamError;
pub use handle::DeviceHandle;
pub use iovec::{
    admit, check_flags, FlagViolation, Iovec, IovecFlags, IOVEC_MAX_SIZE,
};
pub use props::{
    BamBase, BamOptions, BamProperties, ManageFlags, MemBuffer, BAM_MAX_PIPES,
    IPC_DEFAULT_LOGLEVEL, IPC_DUMP_CHANNEL, IPC_LOG_CHANNELS, IPC_MAX_LOGLEVEL,
};
