//! Console device backed by the host's standard streams.

use super::{Console, IoError, OpenFile};
use std::io::{Read, Write};
use std::sync::Arc;

/// A [`Console`] over host stdin/stdout.
pub struct HostConsole;

impl HostConsole {
    /// Create the console device.
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for HostConsole {
    fn open_for_reading(&self) -> Arc<dyn OpenFile> {
        Arc::new(ConsoleIn)
    }

    fn open_for_writing(&self) -> Arc<dyn OpenFile> {
        Arc::new(ConsoleOut)
    }
}

struct ConsoleIn;

impl OpenFile for ConsoleIn {
    fn name(&self) -> &str {
        "console(in)"
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        std::io::stdin().lock().read(buf).map_err(|_| IoError::Device)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, IoError> {
        Err(IoError::Unsupported)
    }

    fn seek(&self, _pos: usize) {}
}

struct ConsoleOut;

impl OpenFile for ConsoleOut {
    fn name(&self) -> &str {
        "console(out)"
    }

    fn read(&self, _buf: &mut [u8]) -> Result<usize, IoError> {
        Err(IoError::Unsupported)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, IoError> {
        let mut out = std::io::stdout().lock();
        out.write_all(buf).map_err(|_| IoError::Device)?;
        out.flush().map_err(|_| IoError::Device)?;
        Ok(buf.len())
    }

    fn seek(&self, _pos: usize) {}
}
