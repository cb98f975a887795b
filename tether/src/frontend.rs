//! Channel context and the frontend loop.
//!
//! One `Frontend` owns one target channel: the byte stream, the argument
//! stack, the handle table (via the dispatcher), and the status machine.
//! The loop pulls one message at a time; `PUSH` feeds the stack, `EXECUTE`
//! dispatches and replies, anything else poisons the channel.

use std::io::{self, Read, Write};

use tether_proto::{status, trace, Header, MAX_STRING_LENGTH, TYPE_RESULT};

use crate::dispatch::{Dispatcher, Reply};
use crate::item::{ArgStack, Item};

/// Channel status machine.
///
/// The numeric values double as the CLI's fallback exit code when the
/// session ends without the target requesting an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// The communication channel is broken; no further traffic.
    Dead = 0,
    /// All conditions nominal.
    Ok = 1,
    /// A push could not be allocated. The next execute is answered with
    /// an allocation-failed status, then normal operation resumes.
    OutOfMemory = 2,
    /// The target requested shutdown via the exit function.
    Exited = 3,
}

impl Status {
    /// Numeric form of the status.
    #[must_use]
    pub fn code(self) -> i32 {
        #[allow(clippy::cast_possible_wrap)]
        {
            self as u32 as i32
        }
    }
}

/// One offloading channel: stream, argument stack, dispatcher, status.
pub struct Frontend<S> {
    /// The bidirectional byte stream to the target.
    stream: S,
    /// Arguments accumulated since the last execute.
    stack: ArgStack,
    /// Executes opcodes and owns the handle table.
    dispatcher: Dispatcher,
    /// Current channel status.
    status: Status,
    /// Exit code captured from the target's exit request.
    exit_code: u32,
}

impl<S: Read + Write> Frontend<S> {
    /// Wraps a channel stream with the default allocation budget.
    pub fn new(stream: S) -> Self {
        Self::with_alloc_limit(stream, MAX_STRING_LENGTH as usize)
    }

    /// Wraps a channel stream with an explicit per-item allocation budget.
    ///
    /// Pushes and outputs larger than the budget behave like an
    /// out-of-memory condition, which is also how tests drive the
    /// recovery path deterministically.
    pub fn with_alloc_limit(stream: S, alloc_limit: usize) -> Self {
        Self {
            stream,
            stack: ArgStack::new(),
            dispatcher: Dispatcher::new(alloc_limit),
            status: Status::Ok,
            exit_code: 0,
        }
    }

    /// Current channel status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Exit code the target supplied, meaningful once the status is
    /// [`Status::Exited`].
    #[must_use]
    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    /// Releases the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Writes the handshake preamble with the downstream argv.
    ///
    /// # Errors
    ///
    /// Any transport error; the channel is unusable on failure.
    pub fn hello(&mut self, args: &[String]) -> io::Result<()> {
        trace!("sending {} downstream argument(s)", args.len());
        tether_proto::write_hello(&mut self.stream, args)
    }

    /// Serves the channel until the target exits or the channel dies.
    /// Descriptors are released when the `Frontend` is dropped.
    pub fn run(&mut self) -> Status {
        while matches!(self.status, Status::Ok | Status::OutOfMemory) {
            self.pull();
        }
        self.status
    }

    /// Reads and processes one message.
    fn pull(&mut self) {
        let header = match tether_proto::read_header(&mut self.stream) {
            Ok(header) => header,
            Err(e) => {
                trace!("receive failure -> dead: {e}");
                self.status = Status::Dead;
                return;
            }
        };
        match header {
            Header::Push { len } => self.push(len),
            Header::Execute { opcode } => self.execute(opcode),
            Header::Result { .. } => self.bad_type(TYPE_RESULT),
            Header::Unknown { kind, .. } => self.bad_type(kind),
        }
    }

    /// Reads one pushed argument onto the stack, or enters the
    /// out-of-memory state while keeping the channel synchronized.
    fn push(&mut self, len: u32) {
        let len = len as usize;
        trace!("received push length={len}");
        if len > self.dispatcher.alloc_limit {
            trace!("failed to allocate {len} bytes for input");
            self.status = Status::OutOfMemory;
            self.drain(len);
            return;
        }
        let mut payload = vec![0u8; len];
        if let Err(e) = self.stream.read_exact(&mut payload) {
            trace!("failed to read {len}-byte input -> dead: {e}");
            self.status = Status::Dead;
            return;
        }
        self.stack.push(Item::new(payload));
    }

    /// Consumes and discards `remaining` payload bytes after a failed
    /// push allocation.
    fn drain(&mut self, mut remaining: usize) {
        let mut chunk = [0u8; 512];
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            if let Err(e) = self.stream.read_exact(&mut chunk[..n]) {
                trace!("failed to drain input with {remaining} bytes left -> dead: {e}");
                self.status = Status::Dead;
                return;
            }
            remaining -= n;
        }
    }

    /// Dispatches one execute request and sends its reply.
    ///
    /// The whole stack is taken up front, so the arguments are released
    /// on every path through here.
    fn execute(&mut self, op: u32) {
        let items = self.stack.take_all();
        if self.status == Status::OutOfMemory {
            // The failed push already swallowed its payload; answer once,
            // then recover.
            trace!("already out of memory");
            drop(items);
            self.reply(status::ALLOC_FAILED, &[]);
            if self.status != Status::Dead {
                self.status = Status::Ok;
            }
            return;
        }
        match self.dispatcher.perform(op, &items) {
            Reply::Exited(code) => {
                // The target stops listening after an exit request.
                self.exit_code = code;
                self.status = Status::Exited;
            }
            Reply::Send { code, outputs } => self.reply(code, &outputs),
        }
    }

    /// Sends the status item, then each data output, in order.
    fn reply(&mut self, code: u32, outputs: &[Item]) {
        trace!("status = {code:#010x}");
        if let Err(e) = tether_proto::write_result(&mut self.stream, &code.to_be_bytes()) {
            trace!("sending status failed -> dead: {e}");
            self.status = Status::Dead;
            return;
        }
        for (i, output) in outputs.iter().enumerate() {
            trace!("sending result {i} ({} bytes)", output.len());
            if let Err(e) = tether_proto::write_result(&mut self.stream, output.bytes()) {
                trace!("sending result {i} failed -> dead: {e}");
                self.status = Status::Dead;
                return;
            }
        }
    }

    /// Poisons the channel after an unrecognized inbound type byte.
    fn bad_type(&mut self, kind: u8) {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("[tether] bad type for inbound message: {kind:#04x}");
        }
        self.status = Status::Dead;
    }
}
