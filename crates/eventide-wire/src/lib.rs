#![warn(missing_docs)]

//! Eventide wire subsystem: binary package codec and length-delimited frame reassembly

pub mod command;
pub mod error;
pub mod framer;
pub mod package;

pub use command::TcpCommand;
pub use error::{Result, WireError};
pub use framer::FrameReassembler;
pub use package::{Credentials, Package, TcpFlags};
