// Cache module - memoisation layers for candidate evaluation
//
// Two layers cooperate: the sequence cache interns instruction sequences so
// identical line programs share one identity, and the per-scanline line
// caches map (entry register state, sequence identity) to a finished
// emulation result. Both are owned per worker; nothing here is shared
// between threads.

pub mod line;
pub mod sequence;

pub use line::{LineCache, LineCacheKey, LineCacheValue};
pub use sequence::{SeqId, SequenceCache};
