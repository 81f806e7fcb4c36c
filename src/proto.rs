use std::fmt;
use std::mem::size_of;

use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::RpcError;

pub const RPC_MAGIC: u64 = 0x87de5d02e6ab95c7;
pub const RPC_VERSION: u32 = 0;

type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

/// 64-bit routing key of a call, composed of a 32-bit interface ID and a
/// 32-bit method ID. The interface occupies the low half, the method the
/// high half. Equality and hashing compare the whole 64-bit value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(u64);

impl FunctionId {
    #[inline(always)]
    pub const fn new(interface: u32, method: u32) -> Self {
        Self(((method as u64) << 32) | interface as u64)
    }

    #[inline(always)]
    pub const fn from_raw(v: u64) -> Self {
        Self(v)
    }

    #[inline(always)]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn interface(&self) -> u32 {
        self.0 as u32
    }

    #[inline(always)]
    pub const fn method(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.interface(), self.method())
    }
}

impl fmt::Debug for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Fixed frame header, 40 bytes on the wire, little-endian:
///
/// | 8B    | 4B      | 4B   | 8B       | 8B  | 8B       |
/// | magic | version | size | function | tag | reserved |
///
/// `size` is the payload length, the header itself not counted.
/// `tag` correlates a response with its request, always increasing per stub.
/// `reserved` is written as zero and ignored on read.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Header {
    magic: Le64,
    version: Le32,
    size: Le32,
    function: Le64,
    tag: Le64,
    reserved: Le64,
}

pub const RPC_HEADER_LEN: usize = size_of::<Header>();

impl Header {
    #[inline]
    pub fn new(function: FunctionId, tag: u64, size: u32) -> Self {
        Self {
            magic: Le64::new(RPC_MAGIC),
            version: Le32::new(RPC_VERSION),
            size: Le32::new(size),
            function: Le64::new(function.as_raw()),
            tag: Le64::new(tag),
            reserved: Le64::new(0),
        }
    }

    /// Parse and validate a header from exactly [RPC_HEADER_LEN] bytes.
    /// A magic or version mismatch is fatal for the stream.
    #[inline]
    pub fn decode(head_buf: &[u8]) -> Result<Self, RpcError> {
        let Some(head) = Header::read_from(head_buf) else {
            return Err(RpcError::Protocol);
        };
        if head.magic.get() != RPC_MAGIC {
            warn!("wrong magic received: {:#x}", head.magic.get());
            return Err(RpcError::Protocol);
        }
        if head.version.get() != RPC_VERSION {
            warn!("version {} not supported", head.version.get());
            return Err(RpcError::Protocol);
        }
        // reserved is not checked, non-zero values pass through
        Ok(head)
    }

    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.size.get()
    }

    #[inline(always)]
    pub fn tag(&self) -> u64 {
        self.tag.get()
    }

    #[inline(always)]
    pub fn function(&self) -> FunctionId {
        FunctionId::from_raw(self.function.get())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[function:{}, tag:{}, size:{}]",
            self.function(),
            self.tag.get(),
            self.size.get(),
        )
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
