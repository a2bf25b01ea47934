//! Bit-flag sets shared across the crate.

use bitflags::bitflags;

bitflags! {
    /// Per-plane flags attached to a stream buffer by the transport.
    ///
    /// Values follow the SPA `spa_data.flags` ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DataFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Data pointer may change between dequeues.
        const DYNAMIC  = 1 << 2;
        /// The fd may be mapped into process memory.
        const MAPPABLE = 1 << 3;
    }
}

bitflags! {
    /// Source kinds offered in the select-sources dialog.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SourceTypes: u32 {
        const MONITOR = 1;
        const WINDOW  = 2;
        const VIRTUAL = 4;
    }
}

impl Default for SourceTypes {
    fn default() -> Self {
        SourceTypes::MONITOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_flags_from_raw() {
        let flags = DataFlags::from_bits_truncate(0b1001);
        assert!(flags.contains(DataFlags::READABLE));
        assert!(flags.contains(DataFlags::MAPPABLE));
        assert!(!flags.contains(DataFlags::WRITABLE));

        let unknown = DataFlags::from_bits_truncate(0x100);
        assert!(unknown.is_empty());
    }

    #[test]
    fn source_types_default_to_monitor() {
        assert_eq!(SourceTypes::default().bits(), 1);
        let both = SourceTypes::MONITOR | SourceTypes::WINDOW;
        assert_eq!(both.bits(), 3);
    }
}
