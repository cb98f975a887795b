//! Host-side offloading frontend.
//!
//! An embedded target uses this host as a remote syscall provider: it
//! pushes serialized arguments and requests function execution over a
//! framed serial protocol, and the host runs the calls against its own
//! OS (sockets, files, directories, sleep) and replies with the results.
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use tether::{send_break, Frontend, SerialPort, Status};
//!
//! # fn main() -> tether::Result<()> {
//! let device = Path::new("/dev/ttyACM0");
//! send_break(device)?;
//! let port = SerialPort::open(device)?;
//!
//! let mut frontend = Frontend::new(port);
//! frontend.hello(&[])?;
//! match frontend.run() {
//!     Status::Exited => println!("target exited with {}", frontend.exit_code()),
//!     other => println!("channel ended with status {}", other.code()),
//! }
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod error;
mod frontend;
mod fsio;
mod handles;
mod item;
mod net;
mod serial;

pub use error::{Error, Result};
pub use frontend::{Frontend, Status};
pub use handles::{HandleTable, Resource, MAX_HANDLES};
pub use item::{ArgStack, Item};
pub use serial::{send_break, SerialPort};
