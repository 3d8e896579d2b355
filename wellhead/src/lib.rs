use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod common;
pub mod encoder;
pub mod partition;
pub mod pipeline;
pub mod shard;
pub mod vocab;
