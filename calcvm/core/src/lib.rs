//! Bytecode VM for embedded closed-loop control.
//!
//! A program runs one instruction per [`Vm::step`] against a shared,
//! byte-addressable [`Memory`]. The memory also holds the URL mapping table
//! a network actor works through (see [`bridge`]), and a [`PidBank`] of
//! controllers ticked on their own cadence reads and writes the same cells.

pub mod bridge;
pub mod clock;
pub mod config;
pub mod error;
pub mod memory;
pub mod opcodes;
pub mod pid;
pub mod rational;
pub mod runtime;
pub mod stack;
pub mod vm;

pub use bridge::{decode_hex, Bridge, ClientRequest, ContentFormat};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::VmConfig;
pub use error::{BridgeError, ConfigError, IdKind, Result, RuntimeError, VmError};
pub use memory::{MapMethod, Memory, UrlMapping, DEFAULT_MEMORY_SIZE, MAP_SIZE, NO_MAPPING};
pub use opcodes::{disassemble, DataType, Opcode, Optype};
pub use pid::{PidBank, PidConfig, PidController, PidDirection, PidMode};
pub use rational::{DefaultRational, Fixed8, Rational};
pub use runtime::{PidTicker, VmCommand, VmRunner};
pub use stack::Stack;
pub use vm::{status_word, Vm, FLAG_DIVIDE_ZERO, FLAG_ERROR, FLAG_HALTED};
