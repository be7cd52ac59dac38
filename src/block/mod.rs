//! The block allocator (tracks free/used byte ranges of the backing file)
//! and the block table (maps stable block numbers to those ranges).

mod allocator;
mod table;

pub use allocator::{merge_blockpairs_into, BlockAllocator, Extent, FragmentationReport};
pub use table::{BlockNum, BlockTable, BlockTranslation, View};
