use std::fmt::Display;

pub type BlockNumber = u32;
pub type RelationId = u32;

/// Stable row identifier: block number plus line number inside the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ItemPointer {
    pub block: BlockNumber,
    pub line: u16,
}

impl ItemPointer {
    pub fn new(block: BlockNumber, line: u16) -> Self {
        Self { block, line }
    }
}

impl Display for ItemPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.block, self.line)
    }
}
