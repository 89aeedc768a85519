//! NBD protocol constants and types.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Only the oldstyle handshake is implemented: the server sends a single
//! 152-byte greeting and moves straight to transmission. The kernel never
//! sees the greeting at all when the socket is handed over with ioctls.

#![allow(dead_code)]

use std::io;

use thiserror::Error;

// Magic values
pub const NBD_MAGIC: &[u8; 8] = b"NBDMAGIC";
pub const NBD_CLISERV_MAGIC: u64 = 0x00420281861253;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u32 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u32 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u32 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u32 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u32 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u32 = 1 << 5;

/// Largest READ or WRITE payload served in one request (32 MiB).
///
/// Bounds the READ/WRITE buffers the server is willing to allocate. TRIM
/// carries no payload and is not subject to it.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISCONNECT: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;

pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;

// Error codes
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_EOVERFLOW: u32 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
    /// A command type this server does not know. It declares no payload,
    /// so skipping it keeps the stream framed.
    Unknown(u16),
}

impl NbdCommand {
    pub fn from_u16(v: u16) -> Self {
        match v {
            NBD_CMD_READ => Self::Read,
            NBD_CMD_WRITE => Self::Write,
            NBD_CMD_DISCONNECT => Self::Disconnect,
            NBD_CMD_FLUSH => Self::Flush,
            NBD_CMD_TRIM => Self::Trim,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISCONNECT,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
            Self::Unknown(v) => v,
        }
    }
}

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:016x}, got 0x{actual:016x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("server error: {code}")]
    ServerError { code: u32 },

    #[error("handle mismatch: expected {expected}, got {actual}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

/// NBD request (28 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdRequest {
    pub flags: u16,
    pub command: NbdCommand,
    /// Opaque to the server, echoed verbatim in the reply.
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    /// Serialize an NBD request to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.to_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse an NBD request header.
    ///
    /// Only the magic is validated. Unknown command types decode to
    /// [`NbdCommand::Unknown`] rather than an error so the caller can decide
    /// to skip them.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC as u64,
                actual: magic as u64,
            });
        }

        // The 32-bit command word carries per-command flags in its high half.
        let flags = u16::from_be_bytes([buf[4], buf[5]]);
        let command = NbdCommand::from_u16(u16::from_be_bytes([buf[6], buf[7]]));
        let handle = u64::from_be_bytes(array(&buf[8..16]));
        let offset = u64::from_be_bytes(array(&buf[16..24]));
        let length = u32::from_be_bytes(array(&buf[24..28]));

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }
}

/// NBD simple reply (16 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REPLY_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let error = u32::from_be_bytes(array(&buf[4..8]));
        let handle = u64::from_be_bytes(array(&buf[8..16]));
        Ok(Self { error, handle })
    }
}

/// Oldstyle server greeting (152 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    pub size_bytes: u64,
    pub flags: u32,
}

impl Greeting {
    pub const SIZE_BYTES: usize = 152;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(NBD_MAGIC);
        buf[8..16].copy_from_slice(&NBD_CLISERV_MAGIC.to_be_bytes());
        buf[16..24].copy_from_slice(&self.size_bytes.to_be_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(array(&buf[0..8]));
        let expected = u64::from_be_bytes(*NBD_MAGIC);
        if magic != expected {
            return Err(NbdError::InvalidMagic {
                expected,
                actual: magic,
            });
        }

        let cliserv = u64::from_be_bytes(array(&buf[8..16]));
        if cliserv != NBD_CLISERV_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_CLISERV_MAGIC,
                actual: cliserv,
            });
        }

        Ok(Self {
            size_bytes: u64::from_be_bytes(array(&buf[16..24])),
            flags: u32::from_be_bytes(array(&buf[24..28])),
        })
    }
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
    assert!(Greeting::SIZE_BYTES == 152);
};

/// Decode a request header.
pub fn decode_request(buf: &[u8; NbdRequest::SIZE_BYTES]) -> Result<NbdRequest, NbdError> {
    NbdRequest::from_bytes(buf)
}

/// Encode a reply header.
pub fn encode_reply(handle: u64, error: u32) -> [u8; NbdReply::SIZE_BYTES] {
    NbdReply::error(handle, error).to_bytes()
}

/// Encode the server greeting.
pub fn encode_greeting(size_bytes: u64, flags: u32) -> [u8; Greeting::SIZE_BYTES] {
    Greeting { size_bytes, flags }.to_bytes()
}

/// Decode the server greeting into `(size_bytes, flags)`.
pub fn decode_greeting(buf: &[u8; Greeting::SIZE_BYTES]) -> Result<(u64, u32), NbdError> {
    let greeting = Greeting::from_bytes(buf)?;
    Ok((greeting.size_bytes, greeting.flags))
}

// Slices passed here are always fixed ranges of a fixed-size buffer.
fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let commands = [
            NbdCommand::Read,
            NbdCommand::Write,
            NbdCommand::Disconnect,
            NbdCommand::Flush,
            NbdCommand::Trim,
            NbdCommand::Unknown(99),
            NbdCommand::Unknown(u16::MAX),
        ];
        for command in commands {
            for flags in [0, NBD_CMD_FLAG_FUA, u16::MAX] {
                for handle in [0, 0x0102_0304_0506_0708, u64::MAX] {
                    for offset in [0, 1 << 40, u64::MAX] {
                        for length in [0, NBD_MAX_PAYLOAD_SIZE, u32::MAX] {
                            let req = NbdRequest {
                                flags,
                                command,
                                handle,
                                offset,
                                length,
                            };
                            let parsed = decode_request(&req.to_bytes()).unwrap();
                            assert_eq!(parsed, req);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn request_layout_matches_wire_table() {
        let req = NbdRequest {
            flags: 0,
            command: NbdCommand::Trim,
            handle: 7,
            offset: 4096,
            length: 8192,
        };
        let buf = req.to_bytes();
        assert_eq!(&buf[0..4], &[0x25, 0x60, 0x95, 0x13]);
        assert_eq!(&buf[4..8], &4u32.to_be_bytes());
        assert_eq!(&buf[16..24], &4096u64.to_be_bytes());
        assert_eq!(&buf[24..28], &8192u32.to_be_bytes());
    }

    #[test]
    fn request_invalid_magic() {
        let buf = [0u8; 28];
        let result = decode_request(&buf);
        assert!(matches!(
            result,
            Err(NbdError::InvalidMagic { actual: 0, .. })
        ));
    }

    #[test]
    fn request_unknown_command_is_not_an_error() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&99u32.to_be_bytes());
        let req = decode_request(&buf).unwrap();
        assert_eq!(req.command, NbdCommand::Unknown(99));
    }

    #[test]
    fn request_command_flags_split_from_type() {
        let mut buf = [0u8; 28];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&NBD_CMD_FLAG_FUA.to_be_bytes());
        buf[6..8].copy_from_slice(&NBD_CMD_WRITE.to_be_bytes());
        let req = decode_request(&buf).unwrap();
        assert_eq!(req.command, NbdCommand::Write);
        assert_eq!(req.flags, NBD_CMD_FLAG_FUA);
    }

    #[test]
    fn reply_echoes_handle() {
        let buf = encode_reply(0xdead_beef_cafe_f00d, NBD_EPERM);
        assert_eq!(&buf[8..16], &0xdead_beef_cafe_f00du64.to_be_bytes());
        let parsed = NbdReply::from_bytes(&buf).unwrap();
        assert_eq!(parsed.error, NBD_EPERM);
        assert_eq!(parsed.handle, 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn greeting_layout() {
        let buf = encode_greeting(1024, NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_TRIM);
        assert_eq!(buf.len(), 152);
        assert_eq!(&buf[0..8], b"NBDMAGIC");
        assert_eq!(&buf[16..24], &1024u64.to_be_bytes());
        assert!(buf[28..].iter().all(|&b| b == 0));
        assert_eq!(
            decode_greeting(&buf).unwrap(),
            (1024, NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_TRIM)
        );
    }

    #[test]
    fn greeting_rejects_bad_magics() {
        let mut buf = encode_greeting(1, 0);
        buf[0] = b'X';
        assert!(matches!(
            decode_greeting(&buf),
            Err(NbdError::InvalidMagic { .. })
        ));

        let mut buf = encode_greeting(1, 0);
        buf[15] ^= 0xff;
        assert!(matches!(
            decode_greeting(&buf),
            Err(NbdError::InvalidMagic {
                expected: NBD_CLISERV_MAGIC,
                ..
            })
        ));
    }

    #[test]
    fn all_commands_parse() {
        for (cmd, expected) in [
            (NbdCommand::Read, NBD_CMD_READ),
            (NbdCommand::Write, NBD_CMD_WRITE),
            (NbdCommand::Disconnect, NBD_CMD_DISCONNECT),
            (NbdCommand::Flush, NBD_CMD_FLUSH),
            (NbdCommand::Trim, NBD_CMD_TRIM),
        ] {
            assert_eq!(cmd.to_u16(), expected);
            assert_eq!(NbdCommand::from_u16(expected), cmd);
        }
    }
}
