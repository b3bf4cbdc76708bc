//! Fixed-capacity packet buffer pools
//!
//! Every [`NetBuf`] comes from a [`BufPool`] and reserves headroom in front of
//! its data so a transport header can be prepended without copying. The slot
//! goes back to the pool when the buffer is dropped.

use std::fmt;
use std::sync::{Arc, Mutex};

struct PoolInner {
    name: &'static str,
    buf_size: usize,
    headroom: usize,
    capacity: usize,
    free: Mutex<usize>,
}

impl PoolInner {
    fn release(&self) {
        let mut free = self.free.lock().unwrap();
        *free += 1;
    }
}

/// A pool of equally sized buffers
#[derive(Clone)]
pub struct BufPool {
    inner: Arc<PoolInner>,
}

impl BufPool {
    /// Create a pool of `count` buffers holding up to `buf_size` bytes of
    /// data after `headroom` reserved bytes
    pub fn new(name: &'static str, count: usize, buf_size: usize, headroom: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                buf_size,
                headroom,
                capacity: count,
                free: Mutex::new(count),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn free_count(&self) -> usize {
        *self.inner.free.lock().unwrap()
    }

    /// Largest data length a buffer of this pool can hold
    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    pub fn headroom(&self) -> usize {
        self.inner.headroom
    }

    fn make_buf(&self) -> NetBuf {
        let headroom = self.inner.headroom;
        NetBuf {
            data: vec![0u8; headroom],
            head: headroom,
            limit: headroom + self.inner.buf_size,
            pool: Some(self.inner.clone()),
        }
    }

    /// Take a buffer without waiting
    pub fn try_alloc(&self) -> Option<NetBuf> {
        let mut free = self.inner.free.lock().unwrap();
        if *free == 0 {
            return None;
        }
        *free -= 1;
        drop(free);
        Some(self.make_buf())
    }
}

impl fmt::Debug for BufPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}

/// A buffer with reserved headroom
///
/// `data[head..]` is the payload. Bytes before `head` are headroom.
pub struct NetBuf {
    data: Vec<u8>,
    head: usize,
    limit: usize,
    pool: Option<Arc<PoolInner>>,
}

impl NetBuf {
    /// A buffer that does not belong to any pool
    pub fn unpooled(headroom: usize, payload: &[u8]) -> Self {
        let mut data = vec![0u8; headroom];
        data.extend_from_slice(payload);
        Self {
            head: headroom,
            limit: data.len(),
            data,
            pool: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Bytes that can still be appended
    pub fn tailroom(&self) -> usize {
        self.limit.saturating_sub(self.data.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Append bytes to the tail. Returns `false` if they do not fit.
    pub fn extend(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.tailroom() {
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }

    /// Prepend a header into the headroom. Returns `false` if it does not fit.
    pub fn push_header(&mut self, header: &[u8]) -> bool {
        if header.len() > self.head {
            return false;
        }
        self.head -= header.len();
        self.data[self.head..self.head + header.len()].copy_from_slice(header);
        true
    }

    /// Drop `len` bytes from the front of the payload
    pub fn pull(&mut self, len: usize) {
        self.head = (self.head + len).min(self.data.len());
    }

    /// Drop everything after the first `len` payload bytes
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(self.head + len);
    }

    /// Clear the payload and restore the original headroom
    pub fn reset(&mut self, headroom: usize) {
        self.data.truncate(headroom.min(self.data.len()));
        self.data.resize(headroom, 0);
        self.head = headroom;
    }

    /// Copy the first `len` payload bytes into a buffer taken from `pool`
    /// and remove them from `self`. `self` keeps the tail.
    pub fn split_front(&mut self, len: usize, pool: &BufPool) -> Option<NetBuf> {
        let len = len.min(self.len());
        let mut front = pool.try_alloc()?;
        if !front.extend(&self.as_slice()[..len]) {
            return None;
        }
        self.pull(len);
        Some(front)
    }
}

impl Drop for NetBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}

impl fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuf")
            .field("len", &self.len())
            .field("headroom", &self.head)
            .field("pool", &self.pool.as_ref().map(|p| p.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_and_release() {
        let pool = BufPool::new("test", 2, 16, 4);
        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());
        assert_eq!(pool.free_count(), 0);

        drop(a);
        assert_eq!(pool.free_count(), 1);
        let c = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());

        drop(b);
        drop(c);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_headroom_and_tailroom() {
        let pool = BufPool::new("test", 1, 8, 4);
        let mut buf = pool.try_alloc().unwrap();
        assert_eq!(buf.headroom(), 4);
        assert!(buf.extend(&[1, 2, 3, 4, 5, 6]));
        assert_eq!(buf.tailroom(), 2);
        assert!(!buf.extend(&[7, 8, 9]));

        assert!(buf.push_header(&[0xAA, 0xBB]));
        assert_eq!(buf.as_slice(), &[0xAA, 0xBB, 1, 2, 3, 4, 5, 6]);
        assert!(!buf.push_header(&[0; 3]));

        buf.pull(2);
        buf.truncate(3);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);

        buf.reset(4);
        assert!(buf.is_empty());
        assert_eq!(buf.headroom(), 4);
    }

    #[test]
    fn test_split_front_keeps_tail_in_original() {
        let frags = BufPool::new("frag", 1, 4, 4);
        let mut buf = NetBuf::unpooled(4, &[1, 2, 3, 4, 5, 6]);

        let front = buf.split_front(4, &frags).unwrap();
        assert_eq!(front.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(buf.as_slice(), &[5, 6]);

        // Pool is empty: nothing is consumed from the original
        assert!(buf.split_front(1, &frags).is_none());
        assert_eq!(buf.as_slice(), &[5, 6]);
    }
}
