//! Transfer descriptors and the rules a batch must pass before submission.

use bitflags::bitflags;

use crate::error::BamError;

/// Largest payload a single descriptor may carry.
pub const IOVEC_MAX_SIZE: u16 = 32 * 1024 - 1;

bitflags! {
    /// Descriptor flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IovecFlags: u16 {
        /// Interrupt on completion.
        const INT = 0x8000;
        /// End of transfer.
        const EOT = 0x4000;
        /// End of block.
        const EOB = 0x2000;
        /// No write-back of the descriptor.
        const NWD = 0x1000;
        /// Command descriptor.
        const CMD = 0x0800;
        /// Lock the pipe group.
        const LOCK = 0x0400;
        /// Unlock the pipe group.
        const UNLOCK = 0x0200;
        /// Immediate command.
        const IMME = 0x0100;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for IovecFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "IovecFlags({=u16:#x})", self.bits())
    }
}

/// One transfer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Iovec {
    pub addr: u64,
    pub size: u16,
    pub flags: IovecFlags,
}

impl Iovec {
    pub const fn new(addr: u64, size: u16, flags: IovecFlags) -> Self {
        Self { addr, size, flags }
    }
}

/// A flag combination that no descriptor may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlagViolation {
    /// NWD requires EOT or CMD.
    NwdWithoutEotOrCmd,
    EotWithCmd,
    /// LOCK and UNLOCK are only meaningful on command descriptors.
    LockWithoutCmd,
    LockWithUnlock,
    ImmeWithCmd,
    ImmeWithNwd,
}

/// Check a flag word against the descriptor combination rules.
pub fn check_flags(flags: IovecFlags) -> Result<(), FlagViolation> {
    use IovecFlags as F;

    if flags.contains(F::NWD) && !flags.intersects(F::EOT | F::CMD) {
        return Err(FlagViolation::NwdWithoutEotOrCmd);
    }
    if flags.contains(F::EOT | F::CMD) {
        return Err(FlagViolation::EotWithCmd);
    }
    if flags.intersects(F::LOCK | F::UNLOCK) && !flags.contains(F::CMD) {
        return Err(FlagViolation::LockWithoutCmd);
    }
    if flags.contains(F::LOCK | F::UNLOCK) {
        return Err(FlagViolation::LockWithUnlock);
    }
    if flags.contains(F::IMME | F::CMD) {
        return Err(FlagViolation::ImmeWithCmd);
    }
    if flags.contains(F::IMME | F::NWD) {
        return Err(FlagViolation::ImmeWithNwd);
    }
    Ok(())
}

/// Admission control for a transfer batch.
///
/// Rejects the whole batch if any descriptor is oversized or carries an
/// invalid flag combination. Nothing is submitted on rejection.
pub fn admit(batch: &[Iovec]) -> Result<(), BamError> {
    if batch.is_empty() {
        error!("transfer: empty descriptor list");
        return Err(BamError::InvalidArgument);
    }
    for (n, iovec) in batch.iter().enumerate() {
        if iovec.size > IOVEC_MAX_SIZE {
            error!("transfer: descriptor {} size {} too large", n, iovec.size);
            return Err(BamError::InvalidDescriptor);
        }
        if let Err(rule) = check_flags(iovec.flags) {
            error!("transfer: descriptor {} rejected: {:?}", n, rule);
            return Err(BamError::InvalidDescriptor);
        }
    }
    Ok(())
}
