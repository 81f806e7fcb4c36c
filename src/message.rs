use crate::iov::{BufferList, IoVector};
use crate::proto::FunctionId;

/// Receive appetite of a [Decode] type: the fixed-size portion plus how
/// many variable-length buffers it wants filled. The stub refuses to issue
/// a call whose response wants more than one variable buffer, and rejects
/// registered receive windows smaller than the fixed portion before
/// anything goes on the wire.
#[derive(Clone, Copy, Debug)]
pub struct RecvLayout {
    pub fixed: usize,
    pub var_bufs: usize,
}

impl Default for RecvLayout {
    #[inline]
    fn default() -> Self {
        Self { fixed: 0, var_bufs: 1 }
    }
}

/// Describe a message as scatter slices for sending.
///
/// Variable-length fields push slices borrowed from the message itself;
/// the core writes them to the stream without copying and never takes
/// ownership.
pub trait Encode {
    fn encode<'a>(&'a self, iov: &mut IoVector<'a>);
}

/// Rebuild a message from a received payload.
///
/// `decode` returns views into the supplied list (cheap [bytes::Bytes]
/// clones), valid for as long as the views are held; no deep copy is made.
pub trait Decode: Sized {
    /// Layout advertisement checked before a call is sent.
    #[inline]
    fn recv_layout() -> RecvLayout {
        RecvLayout::default()
    }

    /// None means the payload is malformed for this type.
    fn decode(buf: &BufferList) -> Option<Self>;

    /// Integrity hook, invoked when a response filled the registered
    /// windows completely.
    #[inline]
    fn validate_checksum(&self, _buf: &BufferList) -> bool {
        true
    }
}

/// A callable operation: a (interface, method) pair with its request and
/// response types. The monomorphized stand-in for a service method table.
pub trait Operation {
    const IID: u32;
    const FID: u32;

    type Request: Encode + Decode + Send + 'static;
    type Response: Encode + Decode + Send + 'static;

    #[inline(always)]
    fn id() -> FunctionId {
        FunctionId::new(Self::IID, Self::FID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Blob {
        data: Bytes,
    }

    impl Encode for Blob {
        fn encode<'a>(&'a self, iov: &mut IoVector<'a>) {
            iov.push(&self.data);
        }
    }

    impl Decode for Blob {
        fn decode(buf: &BufferList) -> Option<Self> {
            Some(Self { data: buf.slice(0, buf.sum())? })
        }
    }

    enum BlobOp {}

    impl Operation for BlobOp {
        const IID: u32 = 9;
        const FID: u32 = 4;
        type Request = Blob;
        type Response = Blob;
    }

    #[test]
    fn test_operation_id() {
        let fid = BlobOp::id();
        assert_eq!(fid.interface(), 9);
        assert_eq!(fid.method(), 4);
    }

    #[test]
    fn test_encode_decode_views() {
        let msg = Blob { data: Bytes::from_static(b"payload") };
        let mut iov = IoVector::new();
        msg.encode(&mut iov);
        assert_eq!(iov.sum(), 7);

        let mut list = BufferList::default();
        list.append(msg.data.clone());
        let back = Blob::decode(&list).expect("decode");
        assert_eq!(back.data, msg.data);
        assert_eq!(Blob::recv_layout().var_bufs, 1);
    }
}
