//! Async front for transports running on tokio.
//!
//! Device calls block on Base fetches and page faults, so every call is moved
//! to the blocking pool instead of stalling the reactor.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::spawn_blocking;

use crate::{
    device::{check_range, Device},
    error::Result,
};

pub struct AsyncDevice<D> {
    inner: Arc<D>,
}

impl<D> Clone for AsyncDevice<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> AsyncDevice<D>
where
    D: Device + 'static,
{
    pub fn new(device: D) -> Self {
        Self::from_arc(Arc::new(device))
    }
    pub fn from_arc(inner: Arc<D>) -> Self {
        Self { inner }
    }
    pub fn get_ref(&self) -> &Arc<D> {
        &self.inner
    }
    pub fn size(&self) -> u64 {
        self.inner.size()
    }
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        // bounds first, `len` comes straight off the wire
        check_range(offset, len, self.size())?;
        let inner = self.inner.clone();
        spawn_blocking(move || -> Result<Bytes> {
            let mut buf = vec![0_u8; len];
            inner.read_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await?
    }
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<usize> {
        let inner = self.inner.clone();
        spawn_blocking(move || inner.write_at(&data, offset)).await?
    }
    pub async fn sync(&self) -> Result<()> {
        let inner = self.inner.clone();
        spawn_blocking(move || inner.sync()).await?
    }
    pub async fn close(&self) -> Result<()> {
        let inner = self.inner.clone();
        spawn_blocking(move || inner.close()).await?
    }
}
