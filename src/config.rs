use crate::{
    chunk::MAX_BLOCK_OFFSET,
    error::{PoolError, PoolResult},
    utils::is_maxaligned,
};

/// Default initial block size (8 KiB).
pub const DEFAULT_INIT_BLOCK_SIZE: usize = 8 * 1024;
/// Default maximum block size (8 MiB).
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 8 * 1024 * 1024;
/// Smallest accepted initial block size.
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Block size parameters of a pool, all in bytes.
///
/// * `min_context_size`: size of the first block (the keeper), or 0 to use
///   `init_block_size` for it.
/// * `init_block_size`: size of the first block obtained by a refill. Each
///   following block doubles it.
/// * `max_block_size`: cap for the doubling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_context_size: usize,
    pub init_block_size: usize,
    pub max_block_size: usize,
}

impl PoolConfig {
    /// For ordinary pools that might hold quite a lot of data.
    pub const DEFAULT: PoolConfig = PoolConfig {
        min_context_size: 0,
        init_block_size: DEFAULT_INIT_BLOCK_SIZE,
        max_block_size: DEFAULT_MAX_BLOCK_SIZE,
    };

    /// For pools that are never expected to hold much data.
    pub const SMALL: PoolConfig = PoolConfig {
        min_context_size: 0,
        init_block_size: 1024,
        max_block_size: 8 * 1024,
    };

    /// For pools that should start small but might sometimes grow big.
    pub const START_SMALL: PoolConfig = PoolConfig {
        min_context_size: 0,
        init_block_size: 1024,
        max_block_size: DEFAULT_MAX_BLOCK_SIZE,
    };

    /// Builds a configuration, substituting the defaults for a zero
    /// `init_block_size` or `max_block_size`.
    pub const fn new(min_context_size: usize, init_block_size: usize, max_block_size: usize) -> Self {
        Self {
            min_context_size,
            init_block_size: if init_block_size == 0 {
                DEFAULT_INIT_BLOCK_SIZE
            } else {
                init_block_size
            },
            max_block_size: if max_block_size == 0 {
                DEFAULT_MAX_BLOCK_SIZE
            } else {
                max_block_size
            },
        }
    }

    /// Checks the parameters against what the pool can represent.
    pub fn validate(&self) -> PoolResult<()> {
        let Self {
            min_context_size: min,
            init_block_size: init,
            max_block_size: max,
        } = *self;

        if !is_maxaligned(init) || init < MIN_BLOCK_SIZE {
            return Err(PoolError::InvalidInitBlockSize(init));
        }

        if !is_maxaligned(max) || max < init {
            return Err(PoolError::InvalidMaxBlockSize { max, init });
        }

        if max > MAX_BLOCK_OFFSET {
            return Err(PoolError::MaxBlockSizeTooLarge {
                max,
                limit: MAX_BLOCK_OFFSET,
            });
        }

        if min != 0 && (!is_maxaligned(min) || min < MIN_BLOCK_SIZE || min > max) {
            return Err(PoolError::InvalidMinContextSize { min, max });
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for config in [PoolConfig::DEFAULT, PoolConfig::SMALL, PoolConfig::START_SMALL] {
            assert_eq!(config.validate(), Ok(()));
        }
    }

    #[test]
    fn zero_sizes_take_defaults() {
        assert_eq!(PoolConfig::new(0, 0, 0), PoolConfig::DEFAULT);
        assert_eq!(PoolConfig::new(0, 1024, 0).max_block_size, DEFAULT_MAX_BLOCK_SIZE);
    }

    #[test]
    fn rejects_small_or_unaligned_init() {
        assert_eq!(
            PoolConfig::new(0, 512, 8192).validate(),
            Err(PoolError::InvalidInitBlockSize(512))
        );
        assert_eq!(
            PoolConfig::new(0, 1028, 8192).validate(),
            Err(PoolError::InvalidInitBlockSize(1028))
        );
    }

    #[test]
    fn rejects_max_below_init() {
        assert_eq!(
            PoolConfig::new(0, 8192, 4096).validate(),
            Err(PoolError::InvalidMaxBlockSize { max: 4096, init: 8192 })
        );
    }

    #[test]
    fn rejects_max_beyond_offset_bound() {
        let max = (MAX_BLOCK_OFFSET + 1).next_multiple_of(8);

        assert_eq!(
            PoolConfig::new(0, 8192, max).validate(),
            Err(PoolError::MaxBlockSizeTooLarge {
                max,
                limit: MAX_BLOCK_OFFSET
            })
        );
    }

    #[test]
    fn min_context_size_bounds() {
        assert!(PoolConfig::new(2048, 1024, 8192).validate().is_ok());
        assert!(PoolConfig::new(512, 1024, 8192).validate().is_err());
        assert!(PoolConfig::new(16384, 1024, 8192).validate().is_err());
    }
}
