/*
   0                                            15                                              31
   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |     command(8)      |                        connection id(24)                              |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                     payload(n, DATA only)                                   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub mod command;

pub use command::Command;

pub const HEAD_LEN: usize = 4;
/// Connection ids occupy the low 24 bits.
pub const MAX_CONNECTION_ID: u32 = 0x00FF_FFFF;
pub const CONNECTION_ID_SPACE: usize = MAX_CONNECTION_ID as usize + 1;

pub struct MuxPacket<B> {
    buffer: B,
}

impl<B: AsRef<[u8]>> MuxPacket<B> {
    pub fn unchecked(buffer: B) -> MuxPacket<B> {
        Self { buffer }
    }
    pub fn new(buffer: B) -> Result<MuxPacket<B>> {
        let len = buffer.as_ref().len();
        if len < HEAD_LEN {
            return Err(Error::InvalidFrame(format!("frame len {len} < {HEAD_LEN}")));
        }
        Ok(Self::unchecked(buffer))
    }
    pub fn command(&self) -> Command {
        self.buffer.as_ref()[0].into()
    }
    pub fn connection_id(&self) -> u32 {
        let buf = self.buffer.as_ref();
        u32::from_be_bytes([0, buf[1], buf[2], buf[3]])
    }
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[HEAD_LEN..]
    }
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl MuxPacket<Bytes> {
    /// Zero-copy payload slice of an owned frame.
    pub fn into_payload(self) -> Bytes {
        self.buffer.slice(HEAD_LEN..)
    }
}

pub struct Builder;

impl Builder {
    pub fn build(command: Command, connection_id: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEAD_LEN + payload.len());
        buf.put_u8(command.into());
        buf.put_slice(&(connection_id & MAX_CONNECTION_ID).to_be_bytes()[1..]);
        buf.put_slice(payload);
        buf.freeze()
    }
    pub fn open(connection_id: u32) -> Bytes {
        Self::build(Command::Open, connection_id, &[])
    }
    pub fn close(connection_id: u32) -> Bytes {
        Self::build(Command::Close, connection_id, &[])
    }
    pub fn data(connection_id: u32, payload: &[u8]) -> Bytes {
        Self::build(Command::Data, connection_id, payload)
    }
}
