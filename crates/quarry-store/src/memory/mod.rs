mod access;
mod store;

pub use access::MemoryAccess;
pub use store::MemoryStore;
