//! Text diagnostic interface.
//!
//! A set of named attributes, each read and written as decimal text. Writing
//! a physical address to `bam_addr` dumps that device with the currently
//! selected options, through the same path as [`Driver::bam_debug_info`].
//! With recording enabled, driver traces are kept in a wrapping in-memory
//! buffer readable from `info`.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};
use core::str::FromStr;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::collab::Platform;
use crate::driver::Driver;
use crate::dump::DumpRequest;
use crate::error::BamError;
use crate::props::IPC_MAX_LOGLEVEL;

/// Longest recorded line, and the slack kept at the end of the buffer.
pub const MAX_MSG_LEN: usize = 128;

const END_MARKER: &[u8] = b"\n**** end line of bam log ****\n\n";

/// Attribute files of the text interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DebugFile {
    /// Write: record buffer size in KiB. Read: recorded text.
    Info,
    /// 0-3. Options 1 and 3 allow recording.
    LoggingOption,
    /// Lowest trace level copied into the record buffer.
    DebugLevelOption,
    /// Stored and read back only; nothing in the driver limits output by it.
    PrintLimitOption,
    /// Dump option code used by `bam_addr`.
    RegDumpOption,
    TestbusSel,
    /// Pipe bitmask used by `bam_addr`.
    BamPipeSel,
    /// Partial FIFO length used by `bam_addr`.
    DescOption,
    /// Write-only: physical address of the device to dump.
    BamAddr,
    /// Log level applied to the device named by `bam_addr`.
    LogLevelSel,
}

impl DebugFile {
    pub const ALL: [DebugFile; 10] = [
        DebugFile::Info,
        DebugFile::LoggingOption,
        DebugFile::DebugLevelOption,
        DebugFile::PrintLimitOption,
        DebugFile::RegDumpOption,
        DebugFile::TestbusSel,
        DebugFile::BamPipeSel,
        DebugFile::DescOption,
        DebugFile::BamAddr,
        DebugFile::LogLevelSel,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DebugFile::Info => "info",
            DebugFile::LoggingOption => "logging_option",
            DebugFile::DebugLevelOption => "debug_level_option",
            DebugFile::PrintLimitOption => "print_limit_option",
            DebugFile::RegDumpOption => "reg_dump_option",
            DebugFile::TestbusSel => "testbus_sel",
            DebugFile::BamPipeSel => "bam_pipe_sel",
            DebugFile::DescOption => "desc_option",
            DebugFile::BamAddr => "bam_addr",
            DebugFile::LogLevelSel => "log_level_sel",
        }
    }
}

impl FromStr for DebugFile {
    type Err = BamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DebugFile::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or(BamError::NotFound)
    }
}

/// Parse the leading decimal digits of `input`, as the attribute files do.
/// Anything after the digits is ignored; no digits parse as zero.
pub fn leading_decimal(input: &str) -> u64 {
    input
        .bytes()
        .take(MAX_MSG_LEN)
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |acc, d| {
            acc.wrapping_mul(10).wrapping_add(u64::from(d - b'0'))
        })
}

struct RecordBuffer {
    buf: Vec<u8>,
    used: usize,
    wrapped: bool,
}

impl RecordBuffer {
    fn new(size: usize) -> Result<Self, BamError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| BamError::ResourceExhausted)?;
        buf.resize(size, 0);
        Ok(Self { buf, used: 0, wrapped: false })
    }

    fn push(&mut self, msg: &[u8]) {
        let size = self.buf.len();
        if self.used + MAX_MSG_LEN >= size {
            self.used = 0;
            self.wrapped = true;
        }
        let n = msg.len().min(size - self.used);
        self.buf[self.used..self.used + n].copy_from_slice(&msg[..n]);
        self.used += n;

        if self.wrapped {
            let k = END_MARKER.len().min(size - self.used);
            self.buf[self.used..self.used + k]
                .copy_from_slice(&END_MARKER[..k]);
        }
    }

    fn contents(&self) -> &[u8] {
        if self.wrapped {
            &self.buf[..self.buf.len() - MAX_MSG_LEN]
        } else {
            &self.buf[..self.used]
        }
    }
}

/// Attribute values and the record buffer.
pub(crate) struct DebugFs {
    logging_option: u8,
    debug_level_option: u8,
    print_limit_option: u8,
    reg_dump_option: u8,
    testbus_sel: u32,
    bam_pipe_sel: u32,
    desc_option: u32,
    log_level_sel: u32,
    record: Option<RecordBuffer>,
}

impl DebugFs {
    pub(crate) const fn new() -> Self {
        Self {
            logging_option: 0,
            debug_level_option: 0,
            print_limit_option: 0,
            reg_dump_option: 0,
            testbus_sel: 0,
            bam_pipe_sel: 0,
            desc_option: 0,
            log_level_sel: IPC_MAX_LOGLEVEL + 1,
            record: None,
        }
    }

    pub(crate) fn record(&mut self, level: usize, args: fmt::Arguments<'_>) {
        if level < usize::from(self.debug_level_option) {
            return;
        }
        let Some(buf) = self.record.as_mut() else {
            return;
        };
        let mut line = heapless::String::<MAX_MSG_LEN>::new();
        let _ = line.write_fmt(args);
        if line.push('\n').is_err() {
            line.pop();
            let _ = line.push('\n');
        }
        buf.push(line.as_bytes());
    }

    fn recording_allowed(&self) -> bool {
        matches!(self.logging_option, 1 | 3)
    }

    fn set_logging_option(&mut self, option: u8) {
        if matches!(option, 0 | 2) && self.recording_allowed() {
            self.record = None;
        }
        self.logging_option = option;
    }

    fn set_buffer_kib(&mut self, kib: u64) -> Result<(), BamError> {
        if !self.recording_allowed() {
            info!("debugfs: recording must be turned on first");
            return Err(BamError::InvalidArgument);
        }
        if kib < 1 {
            info!("debugfs: buffer size must be at least 1 KiB");
            return Err(BamError::InvalidArgument);
        }
        if kib > (i32::MAX as u64) / 1024 {
            error!("debugfs: buffer size is too large");
            return Err(BamError::InvalidArgument);
        }
        let size = kib as usize * 1024;
        if self.record.as_ref().is_some_and(|r| r.buf.len() == size) {
            return Ok(());
        }
        self.record = None;
        self.record = Some(RecordBuffer::new(size).inspect_err(|_| {
            error!("debugfs: cannot allocate {} KiB", kib);
        })?);
        Ok(())
    }

    fn dump_request(&self) -> DumpRequest {
        DumpRequest {
            option: u32::from(self.reg_dump_option),
            pipe_mask: self.bam_pipe_sel,
            testbus_sel: self.testbus_sel,
            desc_sel: self.desc_option,
        }
    }
}

fn to_u8(value: u64) -> Result<u8, BamError> {
    u8::try_from(value).map_err(|_| BamError::InvalidArgument)
}

fn to_u32(value: u64) -> Result<u32, BamError> {
    u32::try_from(value).map_err(|_| BamError::InvalidArgument)
}

impl<M: RawMutex, P: Platform> Driver<M, P> {
    fn debugfs<R>(&self, f: impl FnOnce(&mut DebugFs) -> R) -> R {
        self.debug.lock(|d| f(&mut d.borrow_mut()))
    }

    /// Write `input` to an attribute file. Returns the number of bytes
    /// consumed.
    pub fn debugfs_write(
        &self,
        file: DebugFile,
        input: &str,
    ) -> Result<usize, BamError> {
        let value = leading_decimal(input);
        match file {
            DebugFile::Info => {
                info!("debugfs: buffer size {} KiB", value);
                self.debugfs(|d| d.set_buffer_kib(value))?;
            }
            DebugFile::LoggingOption => {
                if value > 3 {
                    error!("debugfs: invalid logging option {}", value);
                } else {
                    self.debugfs(|d| d.set_logging_option(value as u8));
                }
            }
            DebugFile::DebugLevelOption => {
                let v = to_u8(value)?;
                self.debugfs(|d| d.debug_level_option = v);
            }
            DebugFile::PrintLimitOption => {
                let v = to_u8(value)?;
                self.debugfs(|d| d.print_limit_option = v);
            }
            DebugFile::RegDumpOption => {
                let v = to_u8(value)?;
                self.debugfs(|d| d.reg_dump_option = v);
            }
            DebugFile::TestbusSel => {
                let v = to_u32(value)?;
                self.debugfs(|d| d.testbus_sel = v);
            }
            DebugFile::BamPipeSel => {
                let v = to_u32(value)?;
                self.debugfs(|d| d.bam_pipe_sel = v);
            }
            DebugFile::DescOption => {
                let v = to_u32(value)?;
                self.debugfs(|d| d.desc_option = v);
            }
            DebugFile::LogLevelSel => {
                let v = to_u32(value)?;
                self.debugfs(|d| d.log_level_sel = v);
            }
            DebugFile::BamAddr => self.dump_at(value),
        }
        Ok(input.len())
    }

    fn dump_at(&self, phys_addr: u64) {
        info!("debugfs: BAM physical address {:#x}", phys_addr);
        let Some(device) = self.registry(|r| r.find_phys(phys_addr)) else {
            error!("debugfs: BAM {:#x} is not registered", phys_addr);
            return;
        };
        let (req, level) =
            self.debugfs(|d| (d.dump_request(), d.log_level_sel));
        if level <= IPC_MAX_LOGLEVEL {
            device.set_log_level(level);
        }
        self.run_dump(&device, &req);
    }

    /// Read an attribute file.
    pub fn debugfs_read(&self, file: DebugFile) -> String {
        self.debugfs(|d| {
            let mut out = String::new();
            let _ = match file {
                DebugFile::Info => {
                    if let Some(r) = &d.record {
                        out.push_str(&String::from_utf8_lossy(r.contents()));
                    }
                    Ok(())
                }
                DebugFile::LoggingOption => {
                    writeln!(out, "{}", d.logging_option)
                }
                DebugFile::DebugLevelOption => {
                    writeln!(out, "{}", d.debug_level_option)
                }
                DebugFile::PrintLimitOption => {
                    writeln!(out, "{}", d.print_limit_option)
                }
                DebugFile::RegDumpOption => {
                    writeln!(out, "{}", d.reg_dump_option)
                }
                DebugFile::TestbusSel => writeln!(out, "{}", d.testbus_sel),
                DebugFile::BamPipeSel => writeln!(out, "{}", d.bam_pipe_sel),
                DebugFile::DescOption => writeln!(out, "{}", d.desc_option),
                DebugFile::LogLevelSel => writeln!(out, "{}", d.log_level_sel),
                DebugFile::BamAddr => Ok(()),
            };
            out
        })
    }
}
