// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication strategies composed from the local and remote adapters.

pub mod bidirectional;
pub mod dual_write;
pub mod network;

pub use bidirectional::{BidirectionalSyncAdapter, SyncErrorEntry, SyncStatus};
pub use dual_write::{DualWriteAdapter, SyncStats};
pub use network::{ManualNetworkStatus, NetworkStatusObserver};
