// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal NBD client: fixed newstyle negotiation with `NBD_OPT_GO`, then
//! simple-reply reads. Enough to pull changed extents out of an nbdkit
//! export; bulk copies go through `nbdcopy` instead.
//!
//! Protocol reference:
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NbdError;

pub const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

pub const NBD_OPT_GO: u32 = 7;
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_INFO_EXPORT: u16 = 0;

pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_DISC: u16 = 2;

/// Replies longer than this during negotiation are refused outright.
const MAX_OPTION_REPLY: u32 = 64 * 1024;

/// A negotiated connection to one export.
pub struct NbdClient<S> {
    stream: S,
    size: u64,
    flags: u16,
    next_handle: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> NbdClient<S> {
    /// Negotiates `export` over an already-connected stream.
    pub async fn connect(mut stream: S, export: &str) -> Result<Self, NbdError> {
        let magic = stream.read_u64().await?;
        if magic != NBD_INIT_MAGIC {
            return Err(NbdError::BadMagic { expected: NBD_INIT_MAGIC, found: magic });
        }
        let magic = stream.read_u64().await?;
        if magic != NBD_OPTS_MAGIC {
            return Err(NbdError::BadMagic { expected: NBD_OPTS_MAGIC, found: magic });
        }
        let server_flags = stream.read_u16().await?;
        if server_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
            return Err(NbdError::NotFixedNewstyle);
        }
        let mut client_flags = NBD_FLAG_C_FIXED_NEWSTYLE;
        if server_flags & NBD_FLAG_NO_ZEROES != 0 {
            client_flags |= NBD_FLAG_C_NO_ZEROES;
        }
        stream.write_u32(client_flags).await?;

        // NBD_OPT_GO: export name, then zero information requests.
        let mut buf = BytesMut::with_capacity(16 + 6 + export.len());
        buf.put_u64(NBD_OPTS_MAGIC);
        buf.put_u32(NBD_OPT_GO);
        buf.put_u32(4 + export.len() as u32 + 2);
        buf.put_u32(export.len() as u32);
        buf.put_slice(export.as_bytes());
        buf.put_u16(0);
        stream.write_all(&buf).await?;
        stream.flush().await?;

        let mut export_info = None;
        loop {
            let magic = stream.read_u64().await?;
            if magic != NBD_REP_MAGIC {
                return Err(NbdError::BadMagic { expected: NBD_REP_MAGIC, found: magic });
            }
            let option = stream.read_u32().await?;
            let reply_type = stream.read_u32().await?;
            let len = stream.read_u32().await?;
            if len > MAX_OPTION_REPLY {
                return Err(NbdError::OptionRefused {
                    option,
                    reply_type,
                    message: format!("oversized reply of {len} bytes"),
                });
            }
            let mut data = vec![0u8; len as usize];
            stream.read_exact(&mut data).await?;

            if reply_type & NBD_REP_FLAG_ERROR != 0 {
                return Err(NbdError::OptionRefused {
                    option,
                    reply_type,
                    message: String::from_utf8_lossy(&data).into_owned(),
                });
            }
            match reply_type {
                NBD_REP_INFO if data.len() >= 12 => {
                    let info = u16::from_be_bytes([data[0], data[1]]);
                    if info == NBD_INFO_EXPORT {
                        let mut size = [0u8; 8];
                        size.copy_from_slice(&data[2..10]);
                        let flags = u16::from_be_bytes([data[10], data[11]]);
                        export_info = Some((u64::from_be_bytes(size), flags));
                    }
                }
                NBD_REP_ACK => break,
                // Other informational replies carry nothing we use.
                _ => {}
            }
        }

        let (size, flags) = export_info.ok_or(NbdError::MissingExportInfo)?;
        Ok(Self { stream, size, flags, next_handle: 1 })
    }

    /// Export size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Transmission flags announced by the server.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    fn request(&mut self, cmd: u16, offset: u64, len: u32) -> (u64, BytesMut) {
        let handle = self.next_handle;
        self.next_handle += 1;
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(0);
        buf.put_u16(cmd);
        buf.put_u64(handle);
        buf.put_u64(offset);
        buf.put_u32(len);
        (handle, buf)
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NbdError> {
        let len = buf.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(NbdError::OutOfRange { offset, len, size: self.size });
        }
        let (handle, req) = self.request(NBD_CMD_READ, offset, buf.len() as u32);
        self.stream.write_all(&req).await?;
        self.stream.flush().await?;

        let magic = self.stream.read_u32().await?;
        if magic != NBD_REPLY_MAGIC {
            return Err(NbdError::BadMagic {
                expected: NBD_REPLY_MAGIC as u64,
                found: magic as u64,
            });
        }
        let errno = self.stream.read_u32().await?;
        let reply_handle = self.stream.read_u64().await?;
        if reply_handle != handle {
            return Err(NbdError::HandleMismatch { expected: handle, found: reply_handle });
        }
        if errno != 0 {
            return Err(NbdError::Request { offset, errno });
        }
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    /// Sends `NBD_CMD_DISC`. The server closes without replying.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        let (_, req) = self.request(NBD_CMD_DISC, 0, 0);
        self.stream.write_all(&req).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
