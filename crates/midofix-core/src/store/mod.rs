// # Coordination Store Implementations
//
// Store implementations that live in the core crate. The ZooKeeper client
// lives in its own crate (`midofix-store-zookeeper`).

pub mod memory;

pub use memory::MemoryCoordinationStore;
