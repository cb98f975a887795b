//! Filesystem collaborator: stdio-flavored file operations.
//!
//! The target's runtime exposes `fopen`-style calls, so this module keeps
//! their semantics (mode strings, read-up-to, bounded line reads) on top
//! of `std::fs`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::Path;

use tether_proto::stat;

/// Opens `path` according to an `fopen(3)` mode string.
///
/// Recognized modes: `r`, `r+`, `w`, `w+`, `a`, `a+`, each with an
/// optional `b` suffix (binary is the only representation here, so the
/// suffix is accepted and ignored).
///
/// # Errors
///
/// `InvalidInput` for an unrecognized mode string; otherwise whatever the
/// OS reports for the open itself.
pub fn open(path: &Path, mode: &str) -> io::Result<File> {
    let mut options = OpenOptions::new();
    match mode.trim_end_matches('b') {
        "r" => options.read(true),
        "r+" => options.read(true).write(true),
        "w" => options.write(true).create(true).truncate(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "a+" => options.read(true).append(true).create(true),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported fopen mode {other:?}"),
            ));
        }
    };
    options.open(path)
}

/// Reads up to `size` bytes, like `fread`: short only at end of file.
///
/// # Errors
///
/// Any OS read error.
pub fn read_up_to(file: &mut File, size: usize) -> io::Result<Vec<u8>> {
    let mut data = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    data.truncate(filled);
    Ok(data)
}

/// Reads one line, like `fgets` with a `size`-byte buffer: at most
/// `size - 1` bytes, stopping after a newline. Returns `None` at end of
/// file with nothing read (and for a zero-size buffer).
///
/// Byte-at-a-time so the file position stays exact for a following seek,
/// tell, or read on the same handle.
///
/// # Errors
///
/// Any OS read error.
pub fn read_line_bounded(file: &mut File, size: usize) -> io::Result<Option<Vec<u8>>> {
    if size == 0 {
        return Ok(None);
    }
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while line.len() < size - 1 {
        match file.read(&mut byte) {
            Ok(0) => {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(line))
}

/// Stats `path` and maps its file type onto the wire enum.
///
/// # Errors
///
/// Any OS stat error (missing path included).
pub fn file_type(path: &Path) -> io::Result<u16> {
    let meta = std::fs::metadata(path)?;
    let ty = meta.file_type();
    Ok(if ty.is_file() {
        stat::FILE
    } else if ty.is_dir() {
        stat::DIRECTORY
    } else {
        stat::OTHER
    })
}
