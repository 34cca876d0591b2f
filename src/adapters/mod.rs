//! Storage backends implementing the [`StorageAdapter`] contract.

pub mod local;
pub mod remote;
pub mod traits;

pub use local::{LocalAdapter, LocalDevice, MemoryDevice, StorageUsage};
pub use remote::{
    EntitySchema, InMemoryTableClient, RemoteAdapter, RemoteError, SchemaRegistry, TableClient,
    WriteStrategy,
};
pub use traits::{StorageAdapter, Validator};
