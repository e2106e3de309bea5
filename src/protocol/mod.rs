/*
   0                                            15                                              31
   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |0|                                   session id(31)                                          |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                     datagram(n)                                             |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;

pub const SESSION_HEAD_LEN: usize = 4;
pub const MAX_SESSION_ID: u32 = 0x7FFF_FFFF;

/// One datagram of a UDP flow as carried over the channel.
pub struct SessionPacket<B> {
    buffer: B,
}

impl<B: AsRef<[u8]>> SessionPacket<B> {
    pub fn new(buffer: B) -> Result<SessionPacket<B>> {
        let len = buffer.as_ref().len();
        if len < SESSION_HEAD_LEN {
            return Err(p2ptun_core::error::Error::InvalidFrame(format!(
                "datagram frame len {len} < {SESSION_HEAD_LEN}"
            ))
            .into());
        }
        Ok(Self { buffer })
    }
    pub fn session_id(&self) -> u32 {
        let buf = self.buffer.as_ref();
        u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[SESSION_HEAD_LEN..]
    }
}

pub struct Builder;

impl Builder {
    pub fn build(session_id: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(SESSION_HEAD_LEN + payload.len());
        buf.put_u32(session_id);
        buf.put_slice(payload);
        buf.freeze()
    }
}

pub fn random_session_id() -> u32 {
    rand::random::<u32>() & MAX_SESSION_ID
}
