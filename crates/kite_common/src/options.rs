//! Request option flags.
//!
//! Options form a small bitmask so that a single `u32` can cross the ABI.
//! The native API decodes it once into [`Options`] and passes that around.

/// No options; the default behavior everywhere.
pub const OPTIONS_DEFAULT: u32 = 0;
/// Force durability of a write batch before returning.
pub const OPTION_WRITE_FLUSH: u32 = 1 << 0;
/// Inside a transaction: bypass read-set tracking (reads still happen at the
/// snapshot when the driver can provide one).
pub const OPTION_READ_TRANSPARENT: u32 = 1 << 1;
/// Inside a transaction: writes do not watch the written keys, so blind
/// writes skip read-verification at commit.
pub const OPTION_TXN_DONT_WATCH: u32 = 1 << 2;
/// Scans must not pollute the engine's block cache.
pub const OPTION_SCAN_DONT_FILL_CACHE: u32 = 1 << 3;

const OPTIONS_KNOWN: u32 = OPTION_WRITE_FLUSH
    | OPTION_READ_TRANSPARENT
    | OPTION_TXN_DONT_WATCH
    | OPTION_SCAN_DONT_FILL_CACHE;

/// Decoded request options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub write_flush: bool,
    pub read_transparent: bool,
    pub txn_dont_watch: bool,
    pub scan_dont_fill_cache: bool,
}

impl Options {
    /// Decode a raw bitmask. Unknown bits are rejected so that callers on
    /// newer ABI revisions fail loudly instead of silently losing semantics.
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !OPTIONS_KNOWN != 0 {
            return None;
        }
        Some(Self {
            write_flush: bits & OPTION_WRITE_FLUSH != 0,
            read_transparent: bits & OPTION_READ_TRANSPARENT != 0,
            txn_dont_watch: bits & OPTION_TXN_DONT_WATCH != 0,
            scan_dont_fill_cache: bits & OPTION_SCAN_DONT_FILL_CACHE != 0,
        })
    }

    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.write_flush {
            bits |= OPTION_WRITE_FLUSH;
        }
        if self.read_transparent {
            bits |= OPTION_READ_TRANSPARENT;
        }
        if self.txn_dont_watch {
            bits |= OPTION_TXN_DONT_WATCH;
        }
        if self.scan_dont_fill_cache {
            bits |= OPTION_SCAN_DONT_FILL_CACHE;
        }
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_flags() {
        let opts = Options {
            write_flush: true,
            read_transparent: true,
            txn_dont_watch: true,
            scan_dont_fill_cache: true,
        };
        assert_eq!(Options::from_bits(opts.to_bits()), Some(opts));
    }

    #[test]
    fn test_default_is_zero() {
        assert_eq!(Options::default().to_bits(), OPTIONS_DEFAULT);
        assert_eq!(Options::from_bits(0), Some(Options::default()));
    }

    #[test]
    fn test_unknown_bits_rejected() {
        assert_eq!(Options::from_bits(1 << 17), None);
        assert_eq!(Options::from_bits(OPTION_WRITE_FLUSH | 1 << 31), None);
    }
}
