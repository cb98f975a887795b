//! Serial port adapter: the only OS-variant surface of the frontend.
//!
//! Opens a named device at 9600-8N1 raw mode and exposes it as a plain
//! byte stream. Everything above this module speaks `io::Read`/`io::Write`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};
use tether_proto::trace;

use crate::error::{Error, Result};

/// A serial device configured for the offloading channel.
#[derive(Debug)]
pub struct SerialPort {
    file: File,
}

impl SerialPort {
    /// Opens `path` read+write without becoming its controlling terminal,
    /// with synchronous writes, and configures 9600-8N1 raw mode.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the device cannot be opened, [`Error::Serial`] if
    /// its attributes cannot be read or set.
    pub fn open(path: &Path) -> Result<Self> {
        trace!("opening {}", path.display());
        let file = open_device(path)?;
        configure(&file)?;
        Ok(Self { file })
    }
}

impl io::Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.file, buf)
    }
}

impl io::Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.file, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.file)
    }
}

/// Drives a break condition on `path` to reset the target, then sleeps
/// 2 s so the target can boot far enough to listen.
///
/// A failed break is traced and swallowed: startup proceeds to open the
/// port regardless.
///
/// # Errors
///
/// [`Error::Io`] only if the device itself cannot be opened.
pub fn send_break(path: &Path) -> Result<()> {
    let file = open_device(path)?;
    match termios::tcsendbreak(&file, 0) {
        Ok(()) => std::thread::sleep(Duration::from_secs(2)),
        Err(e) => trace!("tcsendbreak on {} failed: {e}", path.display()),
    }
    Ok(())
}

/// Opens the device with the channel's flag set.
fn open_device(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_SYNC | libc::O_CLOEXEC)
        .open(path)?;
    Ok(file)
}

/// Applies 9600-8N1 raw mode: no parity, one stop bit, no hardware or
/// software flow control, 0.5 s inter-byte read timeout with a one-byte
/// minimum.
fn configure(file: &File) -> Result<()> {
    let mut tty = termios::tcgetattr(file).map_err(|source| Error::Serial {
        op: "tcgetattr",
        source,
    })?;

    termios::cfsetospeed(&mut tty, BaudRate::B9600).map_err(|source| Error::Serial {
        op: "cfsetospeed",
        source,
    })?;
    termios::cfsetispeed(&mut tty, BaudRate::B9600).map_err(|source| Error::Serial {
        op: "cfsetispeed",
        source,
    })?;

    tty.control_flags.remove(ControlFlags::CSIZE);
    tty.control_flags.insert(ControlFlags::CS8);
    tty.control_flags.insert(ControlFlags::CLOCAL | ControlFlags::CREAD);
    tty.control_flags.remove(
        ControlFlags::PARENB | ControlFlags::PARODD | ControlFlags::CSTOPB | ControlFlags::CRTSCTS,
    );

    tty.input_flags.remove(
        InputFlags::IGNBRK | InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY,
    );
    tty.local_flags = LocalFlags::empty();
    tty.output_flags = OutputFlags::empty();

    tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 5;

    termios::tcsetattr(file, SetArg::TCSANOW, &tty).map_err(|source| Error::Serial {
        op: "tcsetattr",
        source,
    })
}
