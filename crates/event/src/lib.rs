//! Event loop core for the embedding layer.
//!
//! * [`GrowBuf`]: geometric append buffer used to build outgoing messages.
//! * [`RingBuffer`]: fixed-capacity circular buffer behind every reader.
//! * [`MultiQueue`]: deferred callbacks with per-source child queues.
//! * [`EventLoop`]: the reactor; the only suspension point of the scheduler.
//! * [`ReadStream`] / [`WriteStream`]: non-blocking pumps over async handles.
//! * [`Process`]: child processes whose exit is delivered through a queue.

pub mod error;
pub mod event_loop;
pub mod growbuf;
pub mod process;
pub mod queue;
pub mod rbuffer;
pub mod stream;

pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle, TimerHandle};
pub use growbuf::GrowBuf;
pub use process::{Process, ProcessIo, ProcessOptions, exit_code};
pub use queue::{Event, MultiQueue};
pub use rbuffer::RingBuffer;
pub use stream::{ReadNotice, ReadStream, WriteNotice, WriteStream};
