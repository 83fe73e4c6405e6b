//! Fetch/decode/execute loop.
//!
//! One call to [`Vm::step`] runs exactly one instruction to completion. Any
//! fault raised while decoding or executing is folded into the flags and the
//! status word, and the VM stays halted until it is cleared or reprogrammed.

use crate::clock::Clock;
use crate::error::{IdKind, Result, VmError, ERROR_CODE_MASK, ERROR_NONE};
use crate::memory::{Memory, MAP_OPTION_RESOURCE_LITERAL, MAP_OPTION_URL_LITERAL};
use crate::opcodes::{Cursor, DataType, Opcode, Optype};
use crate::pid::{PidBank, PidConfig, PidDirection, PidMode};
use crate::rational::{DefaultRational, Rational};
use crate::stack::Stack;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const FLAG_HALTED: u8 = 0x01;
pub const FLAG_ERROR: u8 = 0x02;
pub const FLAG_DIVIDE_ZERO: u8 = 0x04;

/// Packs `(pc << 16) | (opcode << 8) | code`.
pub fn status_word(pc: u16, opcode: u8, code: u8) -> u32 {
    ((pc as u32) << 16) | ((opcode as u32) << 8) | code as u32
}

pub struct Vm<R: Rational = DefaultRational> {
    memory: Arc<Memory<R>>,
    pids: Arc<PidBank<R>>,
    clock: Arc<dyn Clock>,
    stack: Stack,
    pc: u16,
    flags: u8,
    status: u32,
    debug: bool,
}

impl<R: Rational> Vm<R> {
    pub fn new(
        memory: Arc<Memory<R>>,
        pids: Arc<PidBank<R>>,
        clock: Arc<dyn Clock>,
        stack_depth: usize,
    ) -> Self {
        Self {
            memory,
            pids,
            clock,
            stack: Stack::new(stack_depth),
            pc: 0,
            flags: 0,
            status: 0,
            debug: false,
        }
    }

    /// Writes `program` at address 0 and restarts execution there. Memory
    /// past the program and the mapping table are left as they are.
    pub fn load_program(&mut self, program: &[u8]) -> Result<()> {
        self.memory.write_bytes(0, program)?;
        self.clear();
        info!(len = program.len(), "program loaded");
        Ok(())
    }

    /// Rewinds to address 0 with clean flags and an empty stack.
    pub fn clear(&mut self) {
        self.pc = 0;
        self.flags = 0;
        self.status = 0;
        self.stack.clear();
    }

    /// Full reinitialization: memory, mappings, PID bank and VM state.
    pub fn reset(&mut self) {
        self.memory.clear();
        self.pids.clear_all();
        self.clear();
    }

    pub fn step(&mut self) -> Result<()> {
        if self.is_halted() {
            return Ok(());
        }
        let start = self.pc;
        let memory = Arc::clone(&self.memory);
        let byte = match memory.load(start) {
            Ok(byte) => byte,
            Err(err) => {
                self.status = status_word(start, 0, ERROR_NONE);
                return Err(self.fault(start, err));
            }
        };
        self.status = status_word(start, byte, ERROR_NONE);

        let result = Opcode::try_from(byte).and_then(|op| {
            if self.debug {
                debug!(pc = start, op = op.mnemonic(), "execute");
            }
            self.execute(op, &memory, start)
        });
        match result {
            Ok(next) => {
                self.pc = next;
                Ok(())
            }
            Err(err) => Err(self.fault(start, err)),
        }
    }

    /// Steps until halted or `max_steps` instructions ran. Returns the number
    /// of instructions executed, counting a final faulting one.
    pub fn run(&mut self, max_steps: usize) -> usize {
        let mut executed = 0;
        while executed < max_steps && !self.is_halted() {
            executed += 1;
            if self.step().is_err() {
                break;
            }
        }
        executed
    }

    fn fault(&mut self, start: u16, err: VmError) -> VmError {
        self.pc = start;
        self.flags |= FLAG_ERROR | FLAG_HALTED;
        if err == VmError::DivideByZero {
            self.flags |= FLAG_DIVIDE_ZERO;
        }
        self.status = (self.status & !ERROR_CODE_MASK) | err.code() as u32;
        if err == VmError::ResetRequested {
            info!(pc = start, "vm reset by program");
        } else {
            warn!(pc = start, status = format_args!("0x{:08X}", self.status), %err, "vm fault");
        }
        err
    }

    /// Runs one decoded instruction and returns the next pc.
    fn execute(&mut self, op: Opcode, memory: &Memory<R>, start: u16) -> Result<u16> {
        let mut cursor = Cursor::new(memory, start.wrapping_add(1));
        match op {
            Opcode::Halt => {
                self.flags |= FLAG_HALTED;
                return Ok(start);
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Lshift
            | Opcode::Rshift
            | Opcode::Load => {
                let optype = cursor.optype()?;
                let ty = data_type(op, optype)?;
                let dest = cursor.address()?;
                let src = cursor.operand(optype, ty.width::<R>())?;
                apply(memory, op, optype, ty, dest, src)?;
            }
            Opcode::Not => {
                let optype = cursor.optype()?;
                let ty = data_type(op, optype)?;
                let dest = cursor.address()?;
                let value = load_int(memory, ty, dest)?;
                store_int(memory, ty, dest, !value)?;
            }
            Opcode::Multiload => {
                let optype = cursor.optype()?;
                let ty = data_type(op, optype)?;
                let width = ty.width::<R>();
                let dest = cursor.address()?;
                let count = cursor.byte()?;
                for index in 0..count as usize {
                    let src = cursor.operand(optype, width)?;
                    let target = dest as usize + index * width;
                    let target =
                        u16::try_from(target).map_err(|_| VmError::MemoryAccessViolation {
                            op: "multiload",
                            address: target as u32,
                            width,
                        })?;
                    apply(memory, Opcode::Load, optype, ty, target, src)?;
                }
            }
            Opcode::Push | Opcode::Pop => return Err(VmError::UnsupportedOperation(op.byte())),
            Opcode::Copy => {
                let src = cursor.address()?;
                let len = cursor.byte()?;
                let dest = cursor.address()?;
                memory.copy(src, len, dest)?;
            }
            Opcode::Jump => {
                let optype = cursor.optype()?;
                let target = cursor.operand(optype, 2)?;
                return memory.load_address(target);
            }
            Opcode::Compare => {
                let optype = cursor.optype()?;
                let ty = data_type(op, optype)?;
                let dest = cursor.address()?;
                let src = cursor.operand(optype, ty.width::<R>())?;
                let ordering = compare(memory, ty, dest, src)?;
                let less = cursor.address()?;
                let equal = cursor.address()?;
                let greater = cursor.address()?;
                return Ok(match ordering {
                    Ordering::Less => less,
                    Ordering::Equal => equal,
                    Ordering::Greater => greater,
                });
            }
            Opcode::Call => {
                let target = cursor.address()?;
                self.stack.push(cursor.pc())?;
                return Ok(target);
            }
            Opcode::Return => return self.stack.pop(),
            Opcode::Time => {
                let dest = cursor.address()?;
                memory.store_unsigned(dest, self.clock.now_micros() as u32)?;
            }
            Opcode::CompareTime => {
                let stamp = cursor.address()?;
                let timeout_ms = cursor.unsigned()?;
                let expired = cursor.address()?;
                let pending = cursor.address()?;
                let stored = memory.load_unsigned(stamp)?;
                let elapsed = (self.clock.now_micros() as u32).wrapping_sub(stored);
                return Ok(if elapsed as u64 >= timeout_ms as u64 * 1000 {
                    expired
                } else {
                    pending
                });
            }
            Opcode::UrlMap => {
                let optype = cursor.optype()?;
                let options = cursor.byte()?;
                let value = cursor.address()?;
                let port = cursor.address()?;
                let url = if options & MAP_OPTION_URL_LITERAL != 0 {
                    cursor.string()?
                } else {
                    cursor.address()?
                };
                let resource = if options & MAP_OPTION_RESOURCE_LITERAL != 0 {
                    cursor.string()?
                } else {
                    cursor.address()?
                };
                memory.map(optype.id(), optype.0, options, value, port, url, resource)?;
            }
            Opcode::UrlMapCheck => {
                let id = cursor.optype()?.id();
                let dest = cursor.address()?;
                let status = memory.check_map(id, true)?;
                memory.store(dest, status)?;
            }
            Opcode::UrlMapDelete => {
                let id = cursor.optype()?.id();
                memory.unmap(id)?;
            }
            Opcode::PidInit => {
                let id = cursor.optype()?.id();
                self.pid_id(id)?;
                let config = read_pid_config(memory, &mut cursor)?;
                self.pids.init(id, &config)?;
            }
            Opcode::PidClear => {
                let id = cursor.optype()?.id();
                self.pid_id(id)?;
                self.pids.clear(id)?;
            }
            Opcode::PidStop | Opcode::PidRun => {
                let id = cursor.optype()?.id();
                self.pid_id(id)?;
                let mode = if op == Opcode::PidRun {
                    PidMode::Automatic
                } else {
                    PidMode::Manual
                };
                self.pids.set_mode(id, mode)?;
            }
            Opcode::Reset => {
                memory.clear();
                self.stack.clear();
                self.pids.clear_all();
                return Err(VmError::ResetRequested);
            }
        }
        Ok(cursor.pc())
    }

    fn pid_id(&self, id: u8) -> Result<()> {
        if id as usize >= self.pids.len() {
            return Err(VmError::IdUnavailable {
                kind: IdKind::Pid,
                id,
            });
        }
        Ok(())
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    /// Error code of the last fault, `ERROR_NONE` while running cleanly.
    pub fn error_code(&self) -> u8 {
        (self.status & ERROR_CODE_MASK) as u8
    }

    pub fn is_halted(&self) -> bool {
        self.flags & FLAG_HALTED != 0
    }

    pub fn has_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    pub fn memory(&self) -> &Arc<Memory<R>> {
        &self.memory
    }

    pub fn pids(&self) -> &Arc<PidBank<R>> {
        &self.pids
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

fn data_type(op: Opcode, optype: Optype) -> Result<DataType> {
    let unsupported = VmError::UnsupportedOperand {
        mnemonic: op.mnemonic(),
        optype: optype.0,
    };
    let ty = optype.data_type().ok_or(unsupported.clone())?;
    let bitwise = matches!(
        op,
        Opcode::And | Opcode::Or | Opcode::Not | Opcode::Xor | Opcode::Lshift | Opcode::Rshift
    );
    if bitwise && ty == DataType::Rational {
        return Err(unsupported);
    }
    Ok(ty)
}

fn load_int<R: Rational>(memory: &Memory<R>, ty: DataType, address: u16) -> Result<u32> {
    match ty {
        DataType::Uint8 => memory.load(address).map(u32::from),
        DataType::Uint16 => memory.load_address(address).map(u32::from),
        _ => memory.load_unsigned(address),
    }
}

// Narrow types keep the low bits of the 32-bit result.
fn store_int<R: Rational>(memory: &Memory<R>, ty: DataType, address: u16, value: u32) -> Result<()> {
    match ty {
        DataType::Uint8 => memory.store(address, value as u8),
        DataType::Uint16 => memory.store_address(address, value as u16),
        _ => memory.store_unsigned(address, value),
    }
}

fn int_op(op: Opcode, a: u32, b: u32) -> Result<u32> {
    Ok(match op {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div => a.checked_div(b).ok_or(VmError::DivideByZero)?,
        Opcode::Mod => a.checked_rem(b).ok_or(VmError::DivideByZero)?,
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Lshift => a.checked_shl(b).unwrap_or(0),
        Opcode::Rshift => a.checked_shr(b).unwrap_or(0),
        Opcode::Load => b,
        other => return Err(VmError::UnsupportedOperation(other.byte())),
    })
}

fn rational_op<R: Rational>(op: Opcode, a: R, b: R) -> Result<R> {
    Ok(match op {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div | Opcode::Mod if b.is_zero() => return Err(VmError::DivideByZero),
        Opcode::Div => a / b,
        Opcode::Mod => a.rem_real(b),
        Opcode::Load => b,
        other => return Err(VmError::UnsupportedOperation(other.byte())),
    })
}

/// `dest = dest <op> src` (or `dest = src` for LOAD).
fn apply<R: Rational>(
    memory: &Memory<R>,
    op: Opcode,
    optype: Optype,
    ty: DataType,
    dest: u16,
    src: u16,
) -> Result<()> {
    if ty == DataType::Rational {
        let b = memory.load_rational(src)?;
        let a = if op == Opcode::Load {
            R::zero()
        } else {
            memory.load_rational(dest)?
        };
        let result = rational_op(op, a, b).map_err(|err| match err {
            VmError::UnsupportedOperation(_) => VmError::UnsupportedOperand {
                mnemonic: op.mnemonic(),
                optype: optype.0,
            },
            other => other,
        })?;
        return memory.store_rational(dest, result);
    }
    let b = load_int(memory, ty, src)?;
    let a = if op == Opcode::Load {
        0
    } else {
        load_int(memory, ty, dest)?
    };
    store_int(memory, ty, dest, int_op(op, a, b)?)
}

// Unordered rationals (NaN) compare equal.
fn compare<R: Rational>(memory: &Memory<R>, ty: DataType, dest: u16, src: u16) -> Result<Ordering> {
    if ty == DataType::Rational {
        let a = memory.load_rational(dest)?;
        let b = memory.load_rational(src)?;
        return Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal));
    }
    Ok(load_int(memory, ty, dest)?.cmp(&load_int(memory, ty, src)?))
}

fn literal_rational<R: Rational>(
    memory: &Memory<R>,
    cursor: &mut Cursor<'_, Memory<R>>,
) -> Result<R> {
    let at = cursor.literal(R::WIDTH)?;
    memory.load_rational(at)
}

fn read_pid_config<R: Rational>(
    memory: &Memory<R>,
    cursor: &mut Cursor<'_, Memory<R>>,
) -> Result<PidConfig<R>> {
    let input = cursor.address()?;
    let output = cursor.address()?;
    let setpoint = cursor.address()?;
    let kp = literal_rational(memory, cursor)?;
    let ki = literal_rational(memory, cursor)?;
    let kd = literal_rational(memory, cursor)?;
    let sample_time_ms = cursor.unsigned()?;
    let lower_limit = literal_rational(memory, cursor)?;
    let upper_limit = literal_rational(memory, cursor)?;
    let direction = PidDirection::from(cursor.byte()?);
    Ok(PidConfig {
        input,
        output,
        setpoint,
        kp,
        ki,
        kd,
        sample_time_ms,
        direction,
        lower_limit,
        upper_limit,
    })
}
