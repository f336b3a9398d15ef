//! Talking to one language server: launch recipes, transports, framing and
//! JSON-RPC routing.

pub mod capabilities;
pub mod client;
pub mod command;
pub mod connection;
pub mod protocol;

pub use capabilities::{Capability, ServerCapabilities};
pub use client::{RpcClient, Traffic, TrafficTap};
pub use command::JavaProcessCommandBuilder;
pub use connection::{
    ConnectionFactory, ConnectionProvider, InputStream, OutputStream, ProcessConnectionFactory,
    ProcessConnectionProvider, StderrMode, TraceLevel,
};
