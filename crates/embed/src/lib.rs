//! Embedding and control plane.
//!
//! A [`Scheduler`] lets external processes drive the editor over msgpack-RPC
//! channels and lets the editor run and supervise child jobs. It owns the
//! event loop; the host calls [`Scheduler::run_once`] (or [`Scheduler::run`])
//! and every job, channel and handler callback runs on that tick with
//! `&mut Scheduler`.
//!
//! * [`job`]: job table, `job_start` / `job_stop` / `job_wait`
//! * [`channel`]: channel table, requests, notifications, broadcast
//! * [`transport`]: stdio, listening sockets, outgoing connections
//! * [`api`]: built-in introspection handlers

pub mod api;
pub mod channel;
pub mod config;
mod error;
pub mod job;
pub mod logging;
mod scheduler;
pub mod transport;

pub use api::register_builtins;
pub use channel::{ChannelInfo, ChannelSource, ChannelState, Continuation};
pub use config::EmbedConfig;
pub use error::{Error, JobError, Result};
pub use job::{JobId, JobOptions, JobState, JobWait};
pub use scheduler::{CloseHook, Scheduler};
pub use transport::{Address, default_socket_path};
pub use xeno_rpc::{CallError, ChannelId, Method, ParamType, RpcError, Value};
