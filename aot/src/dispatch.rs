// dispatch.rs - Address-indexed dispatch table
//
// One entry per 2-byte granule of executable code, holding the identifier of
// the block that starts there or the all-ones sentinel. Entries are 1, 2 or 4
// bytes wide, whichever is the smallest that fits every identifier.

use crate::cfg::ControlFlowGraph;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    /// First covered address (even)
    pub min_addr: u64,
    /// One past the last covered address (even)
    pub max_addr: u64,
    /// Entry width in bytes
    pub width: u8,
    entries: Vec<u32>,
}

impl DispatchTable {
    /// Build the table over `[min, max)` for every block of `cfg`
    pub fn build(cfg: &ControlFlowGraph, (min_addr, max_addr): (u64, u64)) -> Self {
        let width = entry_width(cfg.blocks.len());
        let sentinel = sentinel_for(width);
        let granules = ((max_addr - min_addr) / 2) as usize;
        let mut entries = vec![sentinel; granules];

        for (start, id) in cfg.block_ids() {
            if start >= min_addr && start < max_addr {
                entries[((start - min_addr) / 2) as usize] = id;
            }
        }

        debug!(
            min = format_args!("0x{:x}", min_addr),
            max = format_args!("0x{:x}", max_addr),
            width,
            granules,
            "built dispatch table"
        );
        Self {
            min_addr,
            max_addr,
            width,
            entries,
        }
    }

    /// Encoded size of the table `build` would produce, without building it
    pub fn encoded_len(block_count: usize, (min_addr, max_addr): (u64, u64)) -> u64 {
        ((max_addr - min_addr) / 2).saturating_mul(entry_width(block_count) as u64)
    }

    pub fn sentinel(&self) -> u32 {
        sentinel_for(self.width)
    }

    /// Covered address range in bytes
    pub fn span(&self) -> u64 {
        self.max_addr - self.min_addr
    }

    pub fn granules(&self) -> usize {
        self.entries.len()
    }

    /// Size of the encoded table in bytes
    pub fn byte_len(&self) -> u64 {
        self.entries.len() as u64 * self.width as u64
    }

    /// Block identifier for `addr`, if a block starts there
    pub fn lookup(&self, addr: u64) -> Option<u32> {
        if addr < self.min_addr || addr >= self.max_addr || addr & 1 != 0 {
            return None;
        }
        let id = self.entries[((addr - self.min_addr) / 2) as usize];
        (id != self.sentinel()).then_some(id)
    }

    /// Little-endian encoding, as placed in the module's data segment
    pub fn to_bytes(&self) -> Vec<u8> {
        let width = self.width as usize;
        let mut bytes = Vec::with_capacity(self.entries.len() * width);
        for entry in &self.entries {
            bytes.extend_from_slice(&entry.to_le_bytes()[..width]);
        }
        bytes
    }
}

fn entry_width(block_count: usize) -> u8 {
    // Identifiers must stay below the all-ones sentinel
    if block_count <= 0xff {
        1
    } else if block_count <= 0xffff {
        2
    } else {
        4
    }
}

fn sentinel_for(width: u8) -> u32 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        _ => u32::MAX,
    }
}
