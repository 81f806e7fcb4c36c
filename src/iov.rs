use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Payload allocator hook. The default hands out zero-initialized
/// `BytesMut` of the requested length; users can plug pooled or aligned
/// allocators instead. Memory is reclaimed by dropping the buffer, the
/// core never frees what it did not allocate.
#[derive(Clone)]
pub struct IoAlloc {
    f: Arc<dyn Fn(usize) -> BytesMut + Send + Sync>,
}

impl IoAlloc {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(usize) -> BytesMut + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Allocate a buffer with `len` initialized bytes.
    #[inline(always)]
    pub fn alloc(&self, len: usize) -> BytesMut {
        (self.f)(len)
    }
}

impl Default for IoAlloc {
    fn default() -> Self {
        Self::new(|len| BytesMut::zeroed(len))
    }
}

impl fmt::Debug for IoAlloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IoAlloc")
    }
}

/// Scatter list of borrowed slices describing an outgoing payload.
/// Variable-length fields point at caller memory; nothing is copied.
#[derive(Default)]
pub struct IoVector<'a> {
    parts: Vec<&'a [u8]>,
}

impl<'a> IoVector<'a> {
    #[inline]
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    #[inline(always)]
    pub fn push(&mut self, part: &'a [u8]) {
        self.parts.push(part);
    }

    /// Total payload length in bytes.
    #[inline]
    pub fn sum(&self) -> usize {
        self.parts.iter().map(|p| p.len()).sum()
    }

    #[inline(always)]
    pub fn iovcnt(&self) -> usize {
        self.parts.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.parts.iter().copied()
    }

    /// Keep the first `len` bytes, dropping the tail.
    pub fn truncate(&mut self, len: usize) {
        let mut remaining = len;
        let mut keep = 0;
        for part in self.parts.iter_mut() {
            if remaining == 0 {
                break;
            }
            if part.len() > remaining {
                *part = &part[..remaining];
            }
            remaining -= part.len();
            keep += 1;
        }
        self.parts.truncate(keep);
    }
}

enum Seg {
    /// A writable receive window, filled by the stream reader
    Raw(BytesMut),
    /// Filled (or caller-supplied) payload data
    Ready(Bytes),
}

impl Seg {
    #[inline(always)]
    fn len(&self) -> usize {
        match self {
            Seg::Raw(b) => b.len(),
            Seg::Ready(b) => b.len(),
        }
    }
}

/// Scatter list of owned segments receiving an incoming payload.
///
/// Callers register receive windows up front ([register](Self::register) /
/// [register_buf](Self::register_buf)); the stream reader fills them in
/// place, so the payload lands in its final memory in a single read. A list
/// with no registered windows allocates from its attached [IoAlloc] once the
/// payload size is known. The payload is never assumed to be contiguous.
pub struct BufferList {
    segs: Vec<Seg>,
    alloc: IoAlloc,
}

impl Default for BufferList {
    fn default() -> Self {
        Self::with_alloc(IoAlloc::default())
    }
}

impl BufferList {
    #[inline]
    pub fn with_alloc(alloc: IoAlloc) -> Self {
        Self { segs: Vec::new(), alloc }
    }

    #[inline(always)]
    pub fn allocator(&self) -> &IoAlloc {
        &self.alloc
    }

    #[inline(always)]
    pub fn set_allocator(&mut self, alloc: IoAlloc) {
        self.alloc = alloc;
    }

    /// Register a receive window of `len` bytes taken from the allocator.
    pub fn register(&mut self, len: usize) {
        let buf = self.alloc.alloc(len);
        self.segs.push(Seg::Raw(buf));
    }

    /// Register a caller-owned receive window. Its `len()` bytes form the
    /// window; the memory stays with this list until frozen and handed back.
    pub fn register_buf(&mut self, buf: BytesMut) {
        self.segs.push(Seg::Raw(buf));
    }

    /// Append already-filled payload data.
    pub fn append(&mut self, data: Bytes) {
        self.segs.push(Seg::Ready(data));
    }

    /// Total length in bytes over all segments.
    #[inline]
    pub fn sum(&self) -> usize {
        self.segs.iter().map(|s| s.len()).sum()
    }

    #[inline(always)]
    pub fn iovcnt(&self) -> usize {
        self.segs.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Keep the first `len` bytes, dropping the tail.
    pub fn truncate(&mut self, len: usize) {
        let mut remaining = len;
        let mut keep = 0;
        for seg in self.segs.iter_mut() {
            if remaining == 0 {
                break;
            }
            if seg.len() > remaining {
                match seg {
                    Seg::Raw(b) => b.truncate(remaining),
                    Seg::Ready(b) => b.truncate(remaining),
                }
            }
            remaining -= seg.len();
            keep += 1;
        }
        self.segs.truncate(keep);
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(|s| match s {
            Seg::Raw(b) => &b[..],
            Seg::Ready(b) => &b[..],
        })
    }

    /// A cheap view of `len` bytes at `offset`. Returns None when the range
    /// is out of bounds, crosses a segment boundary, or the segment has not
    /// been frozen yet.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Bytes> {
        if len == 0 {
            return if offset <= self.sum() { Some(Bytes::new()) } else { None };
        }
        let mut base = 0;
        for seg in self.segs.iter() {
            let end = base + seg.len();
            if offset >= base && offset + len <= end {
                let Seg::Ready(b) = seg else { return None };
                return Some(b.slice(offset - base..offset - base + len));
            }
            base = end;
        }
        None
    }

    /// Gather every segment into one vector. Convenience for tests and
    /// diagnostics, the hot paths never do this.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.sum());
        for part in self.iter() {
            out.extend_from_slice(part);
        }
        out
    }

    /// Seal every raw window into shared, sliceable payload data.
    pub(crate) fn freeze(&mut self) {
        for seg in self.segs.iter_mut() {
            if let Seg::Raw(b) = seg {
                let data = std::mem::take(b).freeze();
                *seg = Seg::Ready(data);
            }
        }
    }

    /// Read exactly `size` bytes from `reader` into the registered windows,
    /// front to back. The caller guarantees `size <= self.sum()`.
    pub(crate) async fn fill_from<R>(&mut self, reader: &mut R, size: usize) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut remaining = size;
        for seg in self.segs.iter_mut() {
            if remaining == 0 {
                break;
            }
            if let Seg::Raw(b) = seg {
                let take = b.len().min(remaining);
                reader.read_exact(&mut b[..take]).await?;
                remaining -= take;
            }
        }
        if remaining > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload exceeds registered windows",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BufferList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BufferList[{} segs, {}B]", self.iovcnt(), self.sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iovector_sum_truncate() {
        let a = [1u8, 2, 3];
        let b = [4u8, 5];
        let mut iov = IoVector::new();
        assert!(iov.is_empty());
        iov.push(&a);
        iov.push(&b);
        assert_eq!(iov.sum(), 5);
        assert_eq!(iov.iovcnt(), 2);

        iov.truncate(4);
        assert_eq!(iov.sum(), 4);
        assert_eq!(iov.iovcnt(), 2);
        let parts: Vec<&[u8]> = iov.iter().collect();
        assert_eq!(parts[1], &[4u8][..]);

        iov.truncate(2);
        assert_eq!(iov.sum(), 2);
        assert_eq!(iov.iovcnt(), 1);
    }

    #[test]
    fn test_bufferlist_basic() {
        let mut list = BufferList::default();
        assert!(list.is_empty());
        list.register(4);
        list.register(8);
        assert_eq!(list.sum(), 12);
        assert_eq!(list.iovcnt(), 2);

        list.truncate(6);
        assert_eq!(list.sum(), 6);
        assert_eq!(list.iovcnt(), 2);

        list.truncate(3);
        assert_eq!(list.sum(), 3);
        assert_eq!(list.iovcnt(), 1);
    }

    #[test]
    fn test_bufferlist_slice() {
        let mut list = BufferList::default();
        list.append(Bytes::from_static(b"hello"));
        list.append(Bytes::from_static(b"world"));
        assert_eq!(list.slice(0, 5).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(list.slice(5, 5).unwrap(), Bytes::from_static(b"world"));
        assert_eq!(list.slice(6, 2).unwrap(), Bytes::from_static(b"or"));
        // crossing the segment boundary is not a contiguous view
        assert!(list.slice(3, 4).is_none());
        assert!(list.slice(8, 5).is_none());
        assert_eq!(list.copy_to_vec(), b"helloworld");
    }

    #[tokio::test]
    async fn test_bufferlist_fill() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        tx.write_all(b"abcdefgh").await.unwrap();

        let mut list = BufferList::default();
        list.register(3);
        list.register(5);
        list.fill_from(&mut rx, 8).await.unwrap();
        list.freeze();
        assert_eq!(list.slice(0, 3).unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(list.slice(3, 5).unwrap(), Bytes::from_static(b"defgh"));
    }

    #[tokio::test]
    async fn test_bufferlist_fill_short_window() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        tx.write_all(b"abcd").await.unwrap();

        let mut list = BufferList::default();
        list.register(2);
        let e = list.fill_from(&mut rx, 4).await;
        assert!(e.is_err());
    }
}
