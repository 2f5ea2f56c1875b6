//! Named-pipe control channel: the cold path used for queries and anything
//! that can tolerate blocking. One pipe per direction, mirroring the
//! original request/response pair rather than a single bidirectional fd.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use rplugin_core::{Error, Result};

use crate::opcode::Opcode;

/// Creates a FIFO at `path`, failing if one already exists there.
///
/// # Safety
/// Thin wrapper around `libc::mkfifo`; `path` must be a valid filesystem
/// path with no embedded NUL.
pub fn make_fifo(path: &Path) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    // SAFETY: `c_path` is a valid, NUL-terminated C string for the duration
    // of this call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// One direction of the control channel: a FIFO opened either for writing
/// (the request side) or reading (the response side from the writer's
/// perspective — each endpoint owns one of each).
pub struct ControlPipe {
    file: File,
}

impl ControlPipe {
    /// Opens `path` for writing, non-blocking, retrying `O_NONBLOCK` opens
    /// against `ENXIO` until a reader appears or `attempts` is exhausted —
    /// this is the client's handshake loop against a helper that hasn't
    /// called `open()` on its end yet.
    pub fn open_writer_with_retry(path: &Path, attempts: u32, delay: std::time::Duration) -> Result<Self> {
        let mut last_err = None;
        for _ in 0..attempts {
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => return Ok(Self { file }),
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    last_err = Some(e);
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Err(Error::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "no reader appeared")
        })))
    }

    pub fn open_reader(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    pub fn open_writer(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self { file })
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).map_err(|_| Error::ConnectionLost)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf).map_err(|_| Error::ConnectionLost)
    }

    pub fn write_opcode(&mut self, opcode: Opcode) -> Result<()> {
        self.write_all(&(opcode as i32).to_ne_bytes())
    }

    pub fn read_opcode(&mut self) -> Result<Opcode> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        let raw = i32::from_ne_bytes(buf);
        Opcode::from_i32(raw)
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown opcode {raw}")))
    }

    pub fn write_int(&mut self, value: i32) -> Result<()> {
        self.write_all(&value.to_ne_bytes())
    }

    pub fn read_int(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    pub fn write_float(&mut self, value: f32) -> Result<()> {
        self.write_all(&value.to_ne_bytes())
    }

    pub fn read_float(&mut self) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(f32::from_ne_bytes(buf))
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_all(&[u8::from(value)])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0] != 0)
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_int(value.len() as i32)?;
        self.write_all(value.as_bytes())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_int()?;
        if !(0..=1 << 20).contains(&len) {
            return Err(Error::ProtocolViolation(format!(
                "implausible string length {len}"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| Error::ProtocolViolation(format!("non-utf8 string: {e}")))
    }

    pub fn write_blob(&mut self, data: &[u8]) -> Result<()> {
        let compressed = crate::blob::compress(data)?;
        self.write_int(compressed.len() as i32)?;
        self.write_int(data.len() as i32)?;
        self.write_all(&compressed)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let compressed_len = self.read_int()?;
        let raw_len = self.read_int()?;
        if !(0..=1 << 28).contains(&compressed_len) || !(0..=1 << 28).contains(&raw_len) {
            return Err(Error::ProtocolViolation("implausible blob length".into()));
        }
        let mut compressed = vec![0u8; compressed_len as usize];
        self.read_exact(&mut compressed)?;
        let data = crate::blob::decompress(&compressed, raw_len as usize)?;
        Ok(data)
    }
}
