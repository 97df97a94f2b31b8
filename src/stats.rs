use std::{fmt, ops::AddAssign};

/// Summary of the memory held by one pool (or by a pool tree, when added up).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryContextCounters {
    /// Blocks obtained from the system allocator.
    pub nblocks: usize,
    /// Chunks sitting on freelists.
    pub freechunks: usize,
    /// Bytes obtained from the system allocator, context header included.
    pub totalspace: usize,
    /// Unused part of `totalspace`: unbumped block tails plus free chunks.
    pub freespace: usize,
}

impl MemoryContextCounters {
    #[inline]
    pub fn used(&self) -> usize {
        self.totalspace - self.freespace
    }
}

impl AddAssign for MemoryContextCounters {
    fn add_assign(&mut self, other: Self) {
        self.nblocks += other.nblocks;
        self.freechunks += other.freechunks;
        self.totalspace += other.totalspace;
        self.freespace += other.freespace;
    }
}

impl fmt::Display for MemoryContextCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total in {} blocks; {} free ({} chunks); {} used",
            self.totalspace,
            self.nblocks,
            self.freespace,
            self.freechunks,
            self.used()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_stats_line() {
        let counters = MemoryContextCounters {
            nblocks: 2,
            freechunks: 3,
            totalspace: 9216,
            freespace: 1000,
        };

        assert_eq!(
            counters.to_string(),
            "9216 total in 2 blocks; 1000 free (3 chunks); 8216 used"
        );
    }

    #[test]
    fn counters_add_up() {
        let mut total = MemoryContextCounters::default();
        let one = MemoryContextCounters {
            nblocks: 1,
            freechunks: 2,
            totalspace: 100,
            freespace: 10,
        };

        total += one;
        total += one;

        assert_eq!(total.nblocks, 2);
        assert_eq!(total.freechunks, 4);
        assert_eq!(total.used(), 180);
    }
}
