//! Reusable byte buffers for body copies.

use std::sync::{Mutex, PoisonError};

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

/// Initial capacity of every pooled buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Buffers that grew past this many default-sized chunks are not kept.
const MAX_RETAINED_MULTIPLE: usize = 64;

#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
            max_idle,
        }
    }

    /// An empty buffer with at least the pool's buffer size of capacity.
    pub fn get(&self) -> BytesMut {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > self.buffer_size * MAX_RETAINED_MULTIPLE {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Read a whole body through a pooled buffer.
    pub async fn collect(&self, body: Body) -> Result<Bytes, axum::Error> {
        let mut buf = self.get();
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(e) => {
                    self.put(buf);
                    return Err(e);
                }
            }
        }
        let bytes = Bytes::copy_from_slice(&buf);
        self.put(buf);
        Ok(bytes)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, 256)
    }
}
