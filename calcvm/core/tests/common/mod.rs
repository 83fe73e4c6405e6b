#![allow(dead_code)]

use calcvm_core::{Fixed8, ManualClock, Memory, PidBank, Vm};
use std::sync::Arc;

pub fn boot(program: &[u8]) -> (Vm<Fixed8>, Arc<ManualClock>) {
    boot_sized(program, 1024)
}

pub fn boot_sized(program: &[u8], memory_size: usize) -> (Vm<Fixed8>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let memory = Arc::new(Memory::new(memory_size));
    let pids = Arc::new(PidBank::new(3, memory.clone(), clock.clone()));
    let mut vm = Vm::new(memory, pids, clock.clone(), 20);
    vm.load_program(program).expect("program fits");
    (vm, clock)
}

/// `while (x <= 10) x++` over a u8 at 0x20, looping back to the start.
pub const WHILE_LOOP: [u8; 21] = [
    0x20, 0x05, 0x20, 0x00, 0x00, // LOAD u8 [0x20] = 0
    0x01, 0x05, 0x20, 0x00, 0x01, // ADD u8 [0x20] += 1
    0x52, 0x05, 0x20, 0x00, 0x0a, 0x05, 0x00, 0x05, 0x00, 0x00, 0x00, // COMPARE 10
];

/// Busy-waits 5 s with TIME/COMPARETIME, then halts.
pub const TIME_LOOP: [u8; 15] = [
    0x60, 0x10, 0x00, // TIME [0x10]
    0x61, 0x10, 0x00, 0x88, 0x13, 0x00, 0x00, 0x0e, 0x00, 0x03, 0x00, // 5000 ms
    0x00,
];

/// Subtraction GCD of two u32 literals into [0x70], timed into [0x84].
pub const GCD: [u8; 99] = [
    0x20, 0x01, 0x70, 0x00, 0x5F, 0xE5, 0x73, 0x6D, // LOAD a
    0x20, 0x01, 0x74, 0x00, 0x82, 0x3F, 0xA5, 0x43, // LOAD b
    0x60, 0x80, 0x00, // TIME start
    0x52, 0x01, 0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2B, 0x00, 0x21, 0x00, 0x2B, 0x00, // a == 0?
    0x20, 0x00, 0x70, 0x00, 0x74, 0x00, // a = b
    0x51, 0x01, 0x59, 0x00, // JUMP end
    0x52, 0x01, 0x74, 0x00, 0x00, 0x00, 0x00, 0x00, 0x39, 0x00, 0x59, 0x00, 0x39, 0x00, // b == 0?
    0x52, 0x00, 0x70, 0x00, 0x74, 0x00, 0x4F, 0x00, 0x4F, 0x00, 0x45, 0x00, // a > b?
    0x02, 0x00, 0x70, 0x00, 0x74, 0x00, // a -= b
    0x51, 0x01, 0x2B, 0x00, //
    0x02, 0x00, 0x74, 0x00, 0x70, 0x00, // b -= a
    0x51, 0x01, 0x2B, 0x00, //
    0x60, 0x84, 0x00, // TIME end
    0x02, 0x00, 0x84, 0x00, 0x80, 0x00, // elapsed
    0x00,
];

/// Thermostat: maps sensor, setpoint and heater cells, starts PID 0.
pub fn heater() -> Vec<u8> {
    let mut program = vec![0x70, 0x02, 0x1F, 0x70, 0x00, 0x00, 0x00];
    program.extend(b"affe::1\0");
    program.extend(b"/sensor\0");
    program.extend([0x70, 0x12, 0x1E, 0x74, 0x00, 0x00, 0x00, 0x07, 0x00]);
    program.extend(b"/setpoint\0");
    program.extend([0x70, 0x22, 0x2E, 0x78, 0x00, 0x00, 0x00, 0x07, 0x00]);
    program.extend(b"/heater\0");
    program.extend([
        0x80, 0x00, 0x70, 0x00, 0x78, 0x00, 0x74, 0x00, // PIDINIT in/out/set
        0x00, 0x14, 0x00, 0x00, // kp 20
        0x00, 0x01, 0x00, 0x00, // ki 1
        0x00, 0x01, 0x00, 0x00, // kd 1
        0xe8, 0x03, 0x00, 0x00, // 1000 ms
        0x00, 0x00, 0x00, 0x00, // lower 0
        0x00, 0x64, 0x00, 0x00, // upper 100
        0x00, // direct
    ]);
    program.extend([0x84, 0x00, 0x00]);
    program
}
