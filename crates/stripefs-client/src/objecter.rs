//! Object store operations issued by the metadata server
//!
//! This module defines the contract between metadata server subsystems and
//! the object store client. Implementations submit the operations to the
//! data cluster; callers await the returned futures for completion. All
//! operations here are idempotent: removing or zeroing an object that is
//! already gone succeeds.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

use stripefs_common::{FileLayout, InodeId, ObjectLocator, ObjectName, Result, SnapContext};

use crate::maps::OsdMapView;

/// Client surface against the object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Remove a single object.
    async fn remove(
        &self,
        oid: &ObjectName,
        locator: &ObjectLocator,
        snapc: &SnapContext,
        mtime: SystemTime,
        flags: u32,
    ) -> Result<()>;

    /// Remove the stripe objects `[first_obj, first_obj + count)` of an
    /// inode's data. The client bounds its own concurrency per call.
    #[allow(clippy::too_many_arguments)]
    async fn purge_range(
        &self,
        ino: InodeId,
        layout: &FileLayout,
        snapc: &SnapContext,
        first_obj: u64,
        count: u64,
        mtime: SystemTime,
        flags: u32,
    ) -> Result<()>;

    /// Zero `length` bytes of an inode's data starting at `offset`.
    /// `truncate_hint` tells the store the zeroing comes from a truncate.
    #[allow(clippy::too_many_arguments)]
    async fn zero(
        &self,
        ino: InodeId,
        layout: &FileLayout,
        snapc: &SnapContext,
        offset: u64,
        length: u64,
        mtime: SystemTime,
        flags: u32,
        truncate_hint: bool,
    ) -> Result<()>;

    /// Consistent snapshot of the object store map this client currently
    /// holds.
    fn osd_map(&self) -> Arc<OsdMapView>;
}
