use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::memory::{Memory, DEFAULT_MEMORY_SIZE, MAP_SIZE, MAX_MEMORY_SIZE};
use crate::pid::{PidBank, DEFAULT_PID_COUNT};
use crate::rational::Rational;
use crate::stack::DEFAULT_STACK_DEPTH;
use crate::vm::Vm;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// PID ids share the 4-bit id field with mapping ids.
pub const MAX_PID_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub memory_size: usize,
    pub stack_depth: usize,
    pub pid_count: usize,
    /// Capped at 16.
    pub map_size: usize,
    pub pid_interval_ms: u64,
    pub step_pause_us: u64,
    pub debug: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            stack_depth: DEFAULT_STACK_DEPTH,
            pid_count: DEFAULT_PID_COUNT,
            map_size: MAP_SIZE,
            pid_interval_ms: 10,
            step_pause_us: 0,
            debug: false,
        }
    }
}

impl VmConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.memory_size == 0, "memory_size must be non-zero"),
            (
                self.memory_size > MAX_MEMORY_SIZE,
                "memory_size exceeds 65535 bytes",
            ),
            (self.stack_depth == 0, "stack_depth must be non-zero"),
            (
                self.stack_depth > MAX_MEMORY_SIZE,
                "stack_depth exceeds 65535 entries",
            ),
            (self.map_size == 0, "map_size must be non-zero"),
            (self.pid_count > MAX_PID_COUNT, "pid_count exceeds 16"),
            (self.pid_interval_ms == 0, "pid_interval_ms must be non-zero"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
            None => Ok(()),
        }
    }

    pub fn pid_interval(&self) -> Duration {
        Duration::from_millis(self.pid_interval_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_micros(self.step_pause_us)
    }

    pub fn build<R: Rational>(&self) -> Result<Vm<R>, ConfigError> {
        self.build_with_clock(Arc::new(MonotonicClock))
    }

    /// Memory, PID bank and VM wired to one clock.
    pub fn build_with_clock<R: Rational>(
        &self,
        clock: Arc<dyn Clock>,
    ) -> Result<Vm<R>, ConfigError> {
        self.validate()?;
        let memory = Arc::new(Memory::with_map_size(self.memory_size, self.map_size));
        let pids = Arc::new(PidBank::new(self.pid_count, memory.clone(), clock.clone()));
        let mut vm = Vm::new(memory, pids, clock, self.stack_depth);
        vm.set_debug(self.debug);
        info!(
            memory = self.memory_size,
            stack = self.stack_depth,
            pids = self.pid_count,
            maps = self.map_size.min(MAP_SIZE),
            rational = R::NAME,
            "vm built"
        );
        Ok(vm)
    }
}
