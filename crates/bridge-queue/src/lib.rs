mod blocking;
mod chunk;

pub use blocking::MpscBlockingQueue;
pub use chunk::{Chunk, SpscChunkQueue};
