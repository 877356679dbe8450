/// Opaque token identifying a registered device.
///
/// A handle encodes a registry slot and the generation of the record that
/// occupied it. Once a device is deregistered its slot generation moves on,
/// so a stale handle fails to resolve instead of reaching a newer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceHandle(u32);

const SLOT_BITS: u32 = 16;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;

/// Highest number of registry slots a handle can address.
pub(crate) const MAX_SLOTS: usize = (SLOT_MASK - 1) as usize;

impl DeviceHandle {
    /// Reserved handle naming system memory as a connection end point.
    pub const MEMORY: Self = Self(0x7fff_ffff);
    /// Reserved handle that never resolves.
    pub const INVALID: Self = Self(0);

    pub(crate) fn new(slot: usize, generation: u16) -> Self {
        debug_assert!(slot < MAX_SLOTS);
        debug_assert!(generation != 0);
        Self(((generation as u32) << SLOT_BITS) | (slot as u32 + 1))
    }

    /// Rebuild a handle from its raw value, e.g. one passed across an ABI.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// `true` for the two reserved values, which never name a device.
    pub const fn is_reserved(&self) -> bool {
        self.0 == Self::MEMORY.0 || self.0 == Self::INVALID.0
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        if self.is_reserved() {
            return None;
        }
        match self.0 & SLOT_MASK {
            0 => None,
            s => Some(s as usize - 1),
        }
    }

    pub(crate) fn generation(&self) -> u16 {
        (self.0 >> SLOT_BITS) as u16
    }
}

impl Default for DeviceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}
