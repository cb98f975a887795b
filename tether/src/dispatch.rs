//! Opcode dispatcher: argument validation, host execution, output encoding.
//!
//! The declared arity rides in bits 4..=7 of the opcode; the dispatcher
//! pulls that many items off the argument stack (top of stack = argument
//! index 0 = the item pushed last) and interprets them per opcode. On any
//! failure the reply collapses to a single status item: data outputs are
//! only ever sent for a fully successful call.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use tether_proto::{
    block, opcode, seek, socket, status, trace, MAX_STRING_LENGTH, TIMEOUT_INFINITE,
};

use crate::fsio;
use crate::handles::{HandleTable, Resource};
use crate::item::Item;
use crate::net;

/// Outcome of one dispatched `EXECUTE`.
#[derive(Debug)]
pub(crate) enum Reply {
    /// Reply with the status item, then the data outputs in index order.
    Send {
        /// Wire status code; nonzero implies `outputs` is empty.
        code: u32,
        /// Data outputs for a successful call.
        outputs: Vec<Item>,
    },
    /// Exit requested: record the code and send nothing.
    Exited(u32),
}

/// Executes opcodes against the host OS for one channel.
pub(crate) struct Dispatcher {
    /// Open file/directory handles owned by this channel.
    handles: HandleTable,
    /// Per-item allocation budget in bytes.
    pub(crate) alloc_limit: usize,
}

impl Dispatcher {
    /// Creates a dispatcher with the given per-item allocation budget.
    pub(crate) fn new(alloc_limit: usize) -> Self {
        Self {
            handles: HandleTable::new(),
            alloc_limit,
        }
    }

    /// Runs one function call against `items` taken off the stack
    /// (top-first, so `items[0]` is the argument pushed last).
    pub(crate) fn perform(&mut self, op: u32, items: &[Item]) -> Reply {
        let arity = opcode::arity(op);
        trace!("executing function 0x{op:06x} arity={arity}");
        if items.len() < arity {
            trace!("too few parameters: {} < {arity}", items.len());
            return Reply::Send {
                code: status::BAD_INPUT,
                outputs: Vec::new(),
            };
        }
        let inputs = &items[..arity];

        if op == opcode::EXIT {
            return match u32_arg(inputs, 0) {
                Ok(code) => {
                    trace!("exit requested, code {code}");
                    Reply::Exited(code)
                }
                Err(code) => Reply::Send {
                    code,
                    outputs: Vec::new(),
                },
            };
        }

        match self.execute(op, inputs) {
            Ok(outputs)
                if outputs
                    .iter()
                    .any(|o| o.len() > MAX_STRING_LENGTH as usize) =>
            {
                // Refused before transmission; the channel stays usable.
                Reply::Send {
                    code: status::UNSUPPORTED_OUTPUT,
                    outputs: Vec::new(),
                }
            }
            Ok(outputs) => Reply::Send {
                code: status::OK,
                outputs,
            },
            Err(code) => Reply::Send {
                code,
                outputs: Vec::new(),
            },
        }
    }

    /// The opcode bodies. Returns the data outputs or a wire status code.
    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, op: u32, inputs: &[Item]) -> Result<Vec<Item>, u32> {
        match op {
            opcode::ECHO => {
                check_alloc(self.alloc_limit, inputs[0].len())?;
                trace!("executing echo ({} bytes)", inputs[0].len());
                Ok(vec![inputs[0].clone()])
            }

            opcode::USLEEP => {
                let usec = u32_arg(inputs, 0)?;
                trace!("executing sleep usec={usec}");
                std::thread::sleep(Duration::from_micros(u64::from(usec)));
                Ok(Vec::new())
            }

            opcode::SOCKET => {
                let host = str_arg(inputs, 0)?;
                let port = str_arg(inputs, 1)?;
                let mode = u16_arg(inputs, 2)?;
                let udp = mode & socket::PROTO_MASK == socket::PROTO_UDP;
                let bind = mode & socket::DIRECTION_MASK == socket::BIND;
                trace!(
                    "executing socket/{} {host}:{port} udp={udp}",
                    if bind { "bind" } else { "connect" }
                );
                let fd = net::open(host, port, udp, bind).map_err(|e| {
                    trace!("socket: {e}");
                    status::BAD_OUTPUT
                })?;
                trace!("socket -> fd {fd}");
                Ok(vec![Item::from_u16(wire_fd(fd)?)])
            }

            opcode::ACCEPT => {
                let bind_fd = u16_arg(inputs, 0)?;
                let buf_size = u32_arg(inputs, 1)? as usize;
                check_alloc(self.alloc_limit, buf_size)?;
                trace!("executing accept fd={bind_fd}");
                let accepted = net::accept(RawFd::from(bind_fd)).map_err(|e| {
                    trace!("accept: {e}");
                    status::BAD_OUTPUT
                })?;
                if accepted.peer_addr.len() > buf_size {
                    trace!("client address does not fit {buf_size} bytes");
                    return Err(status::BAD_OUTPUT);
                }
                trace!(
                    "accept -> bind_fd={} client_fd={}",
                    accepted.bind_fd,
                    accepted.client_fd
                );
                Ok(vec![
                    Item::from_u16(wire_fd(accepted.bind_fd)?),
                    Item::from_u16(wire_fd(accepted.client_fd)?),
                    Item::new(accepted.peer_addr),
                ])
            }

            opcode::SET_BLOCK => {
                let fd = u16_arg(inputs, 0)?;
                let mode = u16_arg(inputs, 1)?;
                trace!("executing set_block fd={fd} mode={mode:#06x}");
                let blocking = match mode {
                    block::BLOCK => true,
                    block::NONBLOCK => false,
                    _ => return Err(status::BAD_INPUT),
                };
                net::set_blocking(RawFd::from(fd), blocking).map_err(|e| {
                    trace!("set_block: {e}");
                    status::BAD_OUTPUT
                })?;
                Ok(Vec::new())
            }

            opcode::RECV => {
                let fd = u16_arg(inputs, 0)?;
                let len = u32_arg(inputs, 1)? as usize;
                let timeout = u32_arg(inputs, 2)?;
                check_alloc(self.alloc_limit, len)?;
                trace!("executing recv fd={fd} len={len} timeout={timeout}");
                let data = if timeout == TIMEOUT_INFINITE {
                    net::recv(RawFd::from(fd), len)
                } else {
                    net::recv_timeout(RawFd::from(fd), len, timeout)
                }
                .map_err(|e| {
                    trace!("recv: {e}");
                    status::BAD_OUTPUT
                })?;
                trace!("received {} bytes on fd={fd}", data.len());
                Ok(vec![Item::new(data)])
            }

            opcode::SEND => {
                let fd = u16_arg(inputs, 0)?;
                let data = inputs[1].bytes();
                trace!("executing send fd={fd} len={}", data.len());
                let sent = net::send(RawFd::from(fd), data).map_err(|e| {
                    trace!("send: {e}");
                    status::BAD_OUTPUT
                })?;
                trace!("sent {sent} bytes on fd={fd}");
                let sent = u32::try_from(sent).map_err(|_| status::BAD_OUTPUT)?;
                Ok(vec![Item::from_u32(sent)])
            }

            opcode::SHUTDOWN => {
                let fd = u16_arg(inputs, 0)?;
                trace!("executing shutdown fd={fd}");
                net::close(RawFd::from(fd));
                Ok(Vec::new())
            }

            opcode::FOPEN => {
                let mode = str_arg(inputs, 0)?;
                let path = path_arg(inputs, 1)?;
                trace!("open file [{}] mode [{mode}]", path.display());
                if self.handles.is_full() {
                    trace!("no free handle slot");
                    return Err(status::BAD_OUTPUT);
                }
                let file = fsio::open(path, mode).map_err(|e| {
                    trace!("fopen: {e}");
                    status::BAD_OUTPUT
                })?;
                let id = self
                    .handles
                    .allocate(Resource::File { file, error: false })
                    .ok_or(status::BAD_OUTPUT)?;
                trace!("allocated handle {id}");
                Ok(vec![Item::from_u32(id)])
            }

            opcode::FREAD => {
                let size = u32_arg(inputs, 0)? as usize;
                let id = u32_arg(inputs, 1)?;
                let limit = self.alloc_limit;
                let (file, error) = self.file_mut(id)?;
                check_alloc(limit, size)?;
                match fsio::read_up_to(file, size) {
                    Ok(data) => Ok(vec![Item::new(data)]),
                    Err(e) => {
                        trace!("fread: {e}");
                        *error = true;
                        Err(status::BAD_OUTPUT)
                    }
                }
            }

            opcode::FGETS => {
                let size = u32_arg(inputs, 0)? as usize;
                let id = u32_arg(inputs, 1)?;
                let limit = self.alloc_limit;
                let (file, error) = self.file_mut(id)?;
                check_alloc(limit, size)?;
                match fsio::read_line_bounded(file, size) {
                    Ok(Some(mut line)) => {
                        line.push(0);
                        Ok(vec![Item::new(line)])
                    }
                    Ok(None) => Err(status::BAD_OUTPUT),
                    Err(e) => {
                        trace!("fgets: {e}");
                        *error = true;
                        Err(status::BAD_OUTPUT)
                    }
                }
            }

            opcode::FWRITE => {
                let id = u32_arg(inputs, 1)?;
                let (file, error) = self.file_mut(id)?;
                match file.write(inputs[0].bytes()) {
                    Ok(written) => {
                        let written = u32::try_from(written).map_err(|_| status::BAD_OUTPUT)?;
                        Ok(vec![Item::from_u32(written)])
                    }
                    Err(e) => {
                        trace!("fwrite: {e}");
                        *error = true;
                        Err(status::BAD_OUTPUT)
                    }
                }
            }

            opcode::FCLOSE => {
                let id = u32_arg(inputs, 0)?;
                match self.handles.get_mut(id) {
                    Some(Resource::File { .. }) => {
                        // Dropping the released resource closes the file.
                        drop(self.handles.release(id));
                        Ok(Vec::new())
                    }
                    _ => Err(status::BAD_OUTPUT),
                }
            }

            opcode::FSEEK => {
                let offset = u32_arg(inputs, 0)?;
                let whence = u32_arg(inputs, 1)?;
                let id = u32_arg(inputs, 2)?;
                let (file, error) = self.file_mut(id)?;
                #[allow(clippy::cast_possible_wrap)]
                let pos = match whence {
                    seek::SET => SeekFrom::Start(u64::from(offset)),
                    seek::CUR => SeekFrom::Current(i64::from(offset as i32)),
                    seek::END => SeekFrom::End(i64::from(offset as i32)),
                    _ => return Err(status::BAD_OUTPUT),
                };
                match file.seek(pos) {
                    Ok(_) => Ok(Vec::new()),
                    Err(e) => {
                        trace!("fseek: {e}");
                        *error = true;
                        Err(status::BAD_OUTPUT)
                    }
                }
            }

            opcode::FTELL => {
                let id = u32_arg(inputs, 0)?;
                let (file, error) = self.file_mut(id)?;
                match file.stream_position() {
                    Ok(pos) => {
                        let pos = u32::try_from(pos).map_err(|_| status::BAD_OUTPUT)?;
                        Ok(vec![Item::from_u32(pos)])
                    }
                    Err(e) => {
                        trace!("ftell: {e}");
                        *error = true;
                        Err(status::BAD_OUTPUT)
                    }
                }
            }

            opcode::FERROR => {
                let id = u32_arg(inputs, 0)?;
                match self.handles.get_mut(id) {
                    Some(Resource::File { error: false, .. }) => Ok(Vec::new()),
                    _ => Err(status::BAD_OUTPUT),
                }
            }

            opcode::DOPEN => {
                let path = path_arg(inputs, 0)?;
                trace!("open dir [{}]", path.display());
                if self.handles.is_full() {
                    trace!("no free handle slot");
                    return Err(status::BAD_OUTPUT);
                }
                let dir = std::fs::read_dir(path).map_err(|e| {
                    trace!("opendir: {e}");
                    status::BAD_OUTPUT
                })?;
                let id = self
                    .handles
                    .allocate(Resource::Dir(dir))
                    .ok_or(status::BAD_OUTPUT)?;
                trace!("allocated handle {id}");
                Ok(vec![Item::from_u32(id)])
            }

            opcode::DREAD => {
                let size = u32_arg(inputs, 0)? as usize;
                let id = u32_arg(inputs, 1)?;
                check_alloc(self.alloc_limit, size)?;
                if size == 0 {
                    return Err(status::BAD_OUTPUT);
                }
                let Some(Resource::Dir(dir)) = self.handles.get_mut(id) else {
                    return Err(status::BAD_OUTPUT);
                };
                match dir.next() {
                    Some(Ok(entry)) => {
                        let name = entry.file_name();
                        let mut name = name.as_bytes().to_vec();
                        // Transmit only what fits, NUL-terminated.
                        name.truncate(size - 1);
                        name.push(0);
                        Ok(vec![Item::new(name)])
                    }
                    // End of directory, or an entry that failed to read.
                    _ => Err(status::BAD_OUTPUT),
                }
            }

            opcode::DCLOSE => {
                let id = u32_arg(inputs, 0)?;
                match self.handles.get_mut(id) {
                    Some(Resource::Dir(_)) => {
                        drop(self.handles.release(id));
                        Ok(Vec::new())
                    }
                    _ => Err(status::BAD_OUTPUT),
                }
            }

            opcode::STAT => {
                let path = path_arg(inputs, 0)?;
                let ty = fsio::file_type(path).map_err(|e| {
                    trace!("stat: {e}");
                    status::BAD_OUTPUT
                })?;
                Ok(vec![Item::from_u16(ty)])
            }

            _ => {
                trace!("unknown function 0x{op:06x}");
                Err(status::BAD_INPUT)
            }
        }
    }

    /// Looks up a file handle, yielding the file and its error flag.
    fn file_mut(&mut self, id: u32) -> Result<(&mut File, &mut bool), u32> {
        match self.handles.get_mut(id) {
            Some(Resource::File { file, error }) => Ok((file, error)),
            _ => Err(status::BAD_OUTPUT),
        }
    }
}

/// Fails with [`status::ALLOC_FAILED`] when `len` exceeds the budget.
fn check_alloc(limit: usize, len: usize) -> Result<(), u32> {
    if len > limit {
        trace!("failed to allocate {len} bytes for output");
        Err(status::ALLOC_FAILED)
    } else {
        Ok(())
    }
}

/// Narrows a host descriptor to the 16-bit form the wire carries.
fn wire_fd(fd: RawFd) -> Result<u16, u32> {
    u16::try_from(fd).map_err(|_| status::BAD_OUTPUT)
}

/// Decodes argument `i` as a big-endian `u16`.
fn u16_arg(inputs: &[Item], i: usize) -> Result<u16, u32> {
    inputs[i].u16_be().ok_or_else(|| {
        trace!("parameter {i} too short: {} < 2", inputs[i].len());
        status::BAD_INPUT
    })
}

/// Decodes argument `i` as a big-endian `u32`.
fn u32_arg(inputs: &[Item], i: usize) -> Result<u32, u32> {
    inputs[i].u32_be().ok_or_else(|| {
        trace!("parameter {i} too short: {} < 4", inputs[i].len());
        status::BAD_INPUT
    })
}

/// Decodes argument `i` as a NUL-terminated UTF-8 string.
fn str_arg(inputs: &[Item], i: usize) -> Result<&str, u32> {
    let bytes = inputs[i].c_bytes().ok_or_else(|| {
        trace!("parameter {i} not NUL terminated");
        status::BAD_INPUT
    })?;
    std::str::from_utf8(bytes).map_err(|_| {
        trace!("parameter {i} is not valid UTF-8");
        status::BAD_INPUT
    })
}

/// Decodes argument `i` as a NUL-terminated path.
fn path_arg(inputs: &[Item], i: usize) -> Result<&Path, u32> {
    let bytes = inputs[i].c_bytes().ok_or_else(|| {
        trace!("parameter {i} not NUL terminated");
        status::BAD_INPUT
    })?;
    Ok(Path::new(std::ffi::OsStr::from_bytes(bytes)))
}

#[cfg(test)]
mod tests {
    #![allow(unsafe_code)]

    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_path(tag: &str) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("tether-dispatch-{tag}-{}-{seq}", std::process::id()))
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(MAX_STRING_LENGTH as usize)
    }

    fn cstr(s: &str) -> Item {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        Item::new(bytes)
    }

    /// Unwraps a reply into (status code, outputs).
    fn sent(reply: Reply) -> (u32, Vec<Item>) {
        match reply {
            Reply::Send { code, outputs } => (code, outputs),
            Reply::Exited(code) => panic!("unexpected exit with code {code}"),
        }
    }

    #[test]
    fn echo_copies_its_input() {
        let mut d = dispatcher();
        let (code, outputs) = sent(d.perform(opcode::ECHO, &[Item::new(b"Hello".to_vec())]));
        assert_eq!(code, status::OK);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].bytes(), b"Hello");
    }

    #[test]
    fn arity_deficit_is_bad_input() {
        let mut d = dispatcher();
        let (code, outputs) = sent(d.perform(opcode::ECHO, &[]));
        assert_eq!(code, status::BAD_INPUT);
        assert!(outputs.is_empty());
    }

    #[test]
    fn unknown_opcode_is_bad_input() {
        let mut d = dispatcher();
        let (code, outputs) = sent(d.perform(0x00FF_10, &[Item::from_u32(0)]));
        assert_eq!(code, status::BAD_INPUT);
        assert!(outputs.is_empty());
    }

    #[test]
    fn exit_reports_its_code_without_outputs() {
        let mut d = dispatcher();
        match d.perform(opcode::EXIT, &[Item::from_u32(42)]) {
            Reply::Exited(code) => assert_eq!(code, 42),
            Reply::Send { code, .. } => panic!("unexpected reply {code}"),
        }
    }

    #[test]
    fn exit_with_short_scalar_is_bad_input() {
        let mut d = dispatcher();
        let (code, outputs) = sent(d.perform(opcode::EXIT, &[Item::new(vec![0, 42])]));
        assert_eq!(code, status::BAD_INPUT);
        assert!(outputs.is_empty());
    }

    #[test]
    fn usleep_returns_without_outputs() {
        let mut d = dispatcher();
        let (code, outputs) = sent(d.perform(opcode::USLEEP, &[Item::from_u32(1_000)]));
        assert_eq!(code, status::OK);
        assert!(outputs.is_empty());
    }

    #[test]
    fn file_write_read_seek_tell_lifecycle() {
        let mut d = dispatcher();
        let path = temp_path("lifecycle");
        let path_item = cstr(path.to_str().unwrap());

        // Open for writing: inputs are mode, then path.
        let (code, outputs) =
            sent(d.perform(opcode::FOPEN, &[cstr("w"), path_item.clone()]));
        assert_eq!(code, status::OK);
        let id = outputs[0].u32_be().unwrap();
        assert!((1..=100).contains(&id));

        // Write: inputs are data, then handle.
        let (code, outputs) = sent(d.perform(
            opcode::FWRITE,
            &[Item::new(b"payload".to_vec()), Item::from_u32(id)],
        ));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].u32_be(), Some(7));

        let (code, _) = sent(d.perform(opcode::FCLOSE, &[Item::from_u32(id)]));
        assert_eq!(code, status::OK);

        // Reopen for reading and get the bytes back.
        let (code, outputs) = sent(d.perform(opcode::FOPEN, &[cstr("r"), path_item]));
        assert_eq!(code, status::OK);
        let id = outputs[0].u32_be().unwrap();

        let (code, outputs) = sent(d.perform(
            opcode::FREAD,
            &[Item::from_u32(64), Item::from_u32(id)],
        ));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].bytes(), b"payload");

        // Rewind and confirm the position.
        let (code, _) = sent(d.perform(
            opcode::FSEEK,
            &[Item::from_u32(0), Item::from_u32(seek::SET), Item::from_u32(id)],
        ));
        assert_eq!(code, status::OK);
        let (code, outputs) = sent(d.perform(opcode::FTELL, &[Item::from_u32(id)]));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].u32_be(), Some(0));

        let (code, _) = sent(d.perform(opcode::FCLOSE, &[Item::from_u32(id)]));
        assert_eq!(code, status::OK);
        // Double close surfaces as a resource error.
        let (code, _) = sent(d.perform(opcode::FCLOSE, &[Item::from_u32(id)]));
        assert_eq!(code, status::BAD_OUTPUT);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bad_seek_whence_is_bad_output() {
        let mut d = dispatcher();
        let path = temp_path("whence");
        std::fs::write(&path, b"x").unwrap();
        let (code, outputs) =
            sent(d.perform(opcode::FOPEN, &[cstr("r"), cstr(path.to_str().unwrap())]));
        assert_eq!(code, status::OK);
        let id = outputs[0].u32_be().unwrap();

        let (code, outputs) = sent(d.perform(
            opcode::FSEEK,
            &[Item::from_u32(0), Item::from_u32(9), Item::from_u32(id)],
        ));
        assert_eq!(code, status::BAD_OUTPUT);
        assert!(outputs.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn fgets_returns_nul_terminated_lines() {
        let mut d = dispatcher();
        let path = temp_path("fgets");
        std::fs::write(&path, b"one\ntwo\n").unwrap();
        let (code, outputs) =
            sent(d.perform(opcode::FOPEN, &[cstr("r"), cstr(path.to_str().unwrap())]));
        assert_eq!(code, status::OK);
        let id = outputs[0].u32_be().unwrap();

        let (code, outputs) = sent(d.perform(
            opcode::FGETS,
            &[Item::from_u32(64), Item::from_u32(id)],
        ));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].bytes(), b"one\n\0");

        let (code, _) = sent(d.perform(
            opcode::FGETS,
            &[Item::from_u32(64), Item::from_u32(id)],
        ));
        assert_eq!(code, status::OK);

        // Past the last line there is nothing left to read.
        let (code, outputs) = sent(d.perform(
            opcode::FGETS,
            &[Item::from_u32(64), Item::from_u32(id)],
        ));
        assert_eq!(code, status::BAD_OUTPUT);
        assert!(outputs.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ferror_reflects_the_sticky_flag() {
        let mut d = dispatcher();
        let path = temp_path("ferror");
        std::fs::write(&path, b"x").unwrap();
        let (code, outputs) =
            sent(d.perform(opcode::FOPEN, &[cstr("r"), cstr(path.to_str().unwrap())]));
        assert_eq!(code, status::OK);
        let id = outputs[0].u32_be().unwrap();

        let (code, _) = sent(d.perform(opcode::FERROR, &[Item::from_u32(id)]));
        assert_eq!(code, status::OK);
        // Unknown handles are a resource error.
        let (code, _) = sent(d.perform(opcode::FERROR, &[Item::from_u32(99)]));
        assert_eq!(code, status::BAD_OUTPUT);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn handle_exhaustion_then_reuse_after_close() {
        let mut d = dispatcher();
        let path = temp_path("exhaust");
        std::fs::write(&path, b"x").unwrap();
        let path_item = cstr(path.to_str().unwrap());

        let mut ids = Vec::new();
        for _ in 0..100 {
            let (code, outputs) =
                sent(d.perform(opcode::FOPEN, &[cstr("r"), path_item.clone()]));
            assert_eq!(code, status::OK);
            ids.push(outputs[0].u32_be().unwrap());
        }
        // The 101st open finds no free slot.
        let (code, outputs) = sent(d.perform(opcode::FOPEN, &[cstr("r"), path_item.clone()]));
        assert_eq!(code, status::BAD_OUTPUT);
        assert!(outputs.is_empty());

        let (code, _) = sent(d.perform(opcode::FCLOSE, &[Item::from_u32(ids[50])]));
        assert_eq!(code, status::OK);
        let (code, outputs) = sent(d.perform(opcode::FOPEN, &[cstr("r"), path_item]));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].u32_be(), Some(ids[50]));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn directory_listing_lifecycle() {
        let mut d = dispatcher();
        let dir = temp_path("dirlist");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("aa"), b"").unwrap();
        std::fs::write(dir.join("bb"), b"").unwrap();

        let (code, outputs) =
            sent(d.perform(opcode::DOPEN, &[cstr(dir.to_str().unwrap())]));
        assert_eq!(code, status::OK);
        let id = outputs[0].u32_be().unwrap();

        let mut names = Vec::new();
        loop {
            let (code, outputs) = sent(d.perform(
                opcode::DREAD,
                &[Item::from_u32(64), Item::from_u32(id)],
            ));
            if code != status::OK {
                assert_eq!(code, status::BAD_OUTPUT);
                break;
            }
            let bytes = outputs[0].bytes();
            assert_eq!(*bytes.last().unwrap(), 0);
            names.push(String::from_utf8(bytes[..bytes.len() - 1].to_vec()).unwrap());
        }
        names.sort();
        assert_eq!(names, ["aa", "bb"]);

        let (code, _) = sent(d.perform(opcode::DCLOSE, &[Item::from_u32(id)]));
        assert_eq!(code, status::OK);
        let (code, _) = sent(d.perform(
            opcode::DREAD,
            &[Item::from_u32(64), Item::from_u32(id)],
        ));
        assert_eq!(code, status::BAD_OUTPUT);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn fclose_on_a_directory_handle_is_bad_output() {
        let mut d = dispatcher();
        let dir = temp_path("mixed");
        std::fs::create_dir(&dir).unwrap();
        let (code, outputs) =
            sent(d.perform(opcode::DOPEN, &[cstr(dir.to_str().unwrap())]));
        assert_eq!(code, status::OK);
        let id = outputs[0].u32_be().unwrap();

        let (code, _) = sent(d.perform(opcode::FCLOSE, &[Item::from_u32(id)]));
        assert_eq!(code, status::BAD_OUTPUT);
        let (code, _) = sent(d.perform(opcode::DCLOSE, &[Item::from_u32(id)]));
        assert_eq!(code, status::OK);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stat_distinguishes_files_and_directories() {
        let mut d = dispatcher();
        let path = temp_path("stat");
        std::fs::write(&path, b"").unwrap();

        let (code, outputs) = sent(d.perform(opcode::STAT, &[cstr(path.to_str().unwrap())]));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].u16_be(), Some(tether_proto::stat::FILE));

        let tmp = std::env::temp_dir();
        let (code, outputs) = sent(d.perform(opcode::STAT, &[cstr(tmp.to_str().unwrap())]));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].u16_be(), Some(tether_proto::stat::DIRECTORY));

        std::fs::remove_file(&path).ok();
        let (code, _) = sent(d.perform(opcode::STAT, &[cstr(path.to_str().unwrap())]));
        assert_eq!(code, status::BAD_OUTPUT);
    }

    #[test]
    fn socket_without_nul_terminator_is_bad_input() {
        let mut d = dispatcher();
        let (code, outputs) = sent(d.perform(
            opcode::SOCKET,
            &[
                Item::new(b"127.0.0.1".to_vec()),
                cstr("80"),
                Item::from_u16(socket::CONNECT | socket::PROTO_TCP),
            ],
        ));
        assert_eq!(code, status::BAD_INPUT);
        assert!(outputs.is_empty());
    }

    #[test]
    fn set_block_rejects_unknown_modes() {
        let mut d = dispatcher();
        let (code, outputs) = sent(d.perform(
            opcode::SET_BLOCK,
            &[Item::from_u16(3), Item::from_u16(7)],
        ));
        assert_eq!(code, status::BAD_INPUT);
        assert!(outputs.is_empty());
    }

    #[test]
    fn recv_over_the_budget_is_alloc_failed() {
        let mut d = Dispatcher::new(16);
        let (code, outputs) = sent(d.perform(
            opcode::RECV,
            &[
                Item::from_u16(3),
                Item::from_u32(1024),
                Item::from_u32(TIMEOUT_INFINITE),
            ],
        ));
        assert_eq!(code, status::ALLOC_FAILED);
        assert!(outputs.is_empty());
    }

    #[test]
    fn tcp_connect_send_recv_through_the_dispatcher() {
        let mut d = dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (code, outputs) = sent(d.perform(
            opcode::SOCKET,
            &[
                cstr("127.0.0.1"),
                cstr(&port.to_string()),
                Item::from_u16(socket::CONNECT | socket::PROTO_TCP),
            ],
        ));
        assert_eq!(code, status::OK);
        let fd = outputs[0].u16_be().unwrap();

        let (mut server, _) = listener.accept().unwrap();

        let (code, outputs) = sent(d.perform(
            opcode::SEND,
            &[Item::from_u16(fd), Item::new(b"ping".to_vec())],
        ));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].u32_be(), Some(4));

        use std::io::{Read as _, Write as _};
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        server.write_all(b"pong").unwrap();

        let (code, outputs) = sent(d.perform(
            opcode::RECV,
            &[
                Item::from_u16(fd),
                Item::from_u32(16),
                Item::from_u32(TIMEOUT_INFINITE),
            ],
        ));
        assert_eq!(code, status::OK);
        assert_eq!(outputs[0].bytes(), b"pong");

        let (code, _) = sent(d.perform(opcode::SHUTDOWN, &[Item::from_u16(fd)]));
        assert_eq!(code, status::OK);
    }

    #[test]
    fn tcp_accept_through_the_dispatcher() {
        let mut d = dispatcher();
        let (code, outputs) = sent(d.perform(
            opcode::SOCKET,
            &[
                cstr("127.0.0.1"),
                cstr("0"),
                Item::from_u16(socket::BIND | socket::PROTO_TCP),
            ],
        ));
        assert_eq!(code, status::OK);
        let bind_fd = outputs[0].u16_be().unwrap();

        // Recover the ephemeral port from the raw descriptor.
        // SAFETY: bind_fd is a live listener; ownership is handed back
        // via into_raw_fd before the wrapper drops.
        let listener = unsafe { TcpListener::from_raw_fd(RawFd::from(bind_fd)) };
        let port = listener.local_addr().unwrap().port();
        let _ = listener.into_raw_fd();

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let (code, outputs) = sent(d.perform(
            opcode::ACCEPT,
            &[Item::from_u16(bind_fd), Item::from_u32(16)],
        ));
        assert_eq!(code, status::OK);
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].u16_be(), Some(bind_fd));
        let client_fd = outputs[1].u16_be().unwrap();
        assert_ne!(client_fd, bind_fd);
        assert_eq!(outputs[2].bytes(), &[127, 0, 0, 1]);

        let (code, _) = sent(d.perform(opcode::SHUTDOWN, &[Item::from_u16(client_fd)]));
        assert_eq!(code, status::OK);
        let (code, _) = sent(d.perform(opcode::SHUTDOWN, &[Item::from_u16(bind_fd)]));
        assert_eq!(code, status::OK);
    }
}
