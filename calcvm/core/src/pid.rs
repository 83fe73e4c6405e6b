//! PID controller bank driven by the VM and ticked by a periodic task.
//!
//! Each controller reads its input and setpoint from memory and writes its
//! output back there. Gains are stored pre-scaled by the sample period
//! (`ki * period`, `kd / period`) and negated for reverse action, so
//! `compute` only multiplies and adds. The integral accumulator is clamped to
//! the output limits (anti-windup), and switching to automatic seeds state from
//! the live values so the output does not jump.

use crate::clock::Clock;
use crate::error::{IdKind, Result, VmError};
use crate::memory::{Memory, MAP_STATUS_DONE};
use crate::rational::{DefaultRational, Rational};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_PID_COUNT: usize = 3;
pub const MIN_SAMPLE_TIME_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PidMode {
    #[default]
    Manual = 0,
    Automatic = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PidDirection {
    #[default]
    Direct = 0,
    Reverse = 1,
}

impl From<u8> for PidDirection {
    fn from(value: u8) -> Self {
        if value == PidDirection::Reverse as u8 {
            PidDirection::Reverse
        } else {
            PidDirection::Direct
        }
    }
}

/// Parameters decoded from a PIDINIT instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidConfig<R: Rational = DefaultRational> {
    pub input: u16,
    pub output: u16,
    pub setpoint: u16,
    pub kp: R,
    pub ki: R,
    pub kd: R,
    pub sample_time_ms: u32,
    pub direction: PidDirection,
    pub lower_limit: R,
    pub upper_limit: R,
}

#[derive(Debug, Clone)]
pub struct PidController<R: Rational = DefaultRational> {
    id: u8,
    input: u16,
    output: u16,
    setpoint: u16,
    kp: R,
    ki: R,
    kd: R,
    out_min: R,
    out_max: R,
    direction: PidDirection,
    sample_time_ms: u32,
    i_sum: R,
    last_input: R,
    last_time_ms: u64,
    mode: PidMode,
    initialized: bool,
    map_id: Option<u8>,
}

impl<R: Rational> PidController<R> {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            input: 0,
            output: 0,
            setpoint: 0,
            kp: R::zero(),
            ki: R::zero(),
            kd: R::zero(),
            out_min: R::zero(),
            out_max: R::zero(),
            direction: PidDirection::Direct,
            sample_time_ms: MIN_SAMPLE_TIME_MS,
            i_sum: R::zero(),
            last_input: R::zero(),
            last_time_ms: 0,
            mode: PidMode::Manual,
            initialized: false,
            map_id: None,
        }
    }

    /// Binds the controller to memory cells. Starts in manual mode; fails if
    /// the controller was not cleared since its last init.
    pub fn init(&mut self, memory: &Memory<R>, config: &PidConfig<R>, now_ms: u64) -> Result<()> {
        if self.initialized {
            return Err(VmError::PidAlreadyInitialized(self.id));
        }
        self.input = config.input;
        self.output = config.output;
        self.setpoint = config.setpoint;
        self.mode = PidMode::Manual;
        self.i_sum = R::zero();
        self.last_input = R::zero();
        self.set_output_limits(memory, config.lower_limit, config.upper_limit)?;
        self.sample_time_ms = config.sample_time_ms.max(MIN_SAMPLE_TIME_MS);
        self.set_controller_direction(config.direction);
        self.set_tunings(config.kp, config.ki, config.kd);
        self.last_time_ms = now_ms.wrapping_sub(self.sample_time_ms as u64);
        self.map_id = memory.map_for_address(self.input);
        self.initialized = true;
        Ok(())
    }

    /// Runs one control step if the sample period elapsed. Returns whether a
    /// new output was written.
    pub fn compute(&mut self, memory: &Memory<R>, now_ms: u64) -> Result<bool> {
        if !self.initialized || self.mode != PidMode::Automatic {
            return Ok(false);
        }
        if let Some(map_id) = self.map_id {
            if memory.check_map(map_id, false)? > MAP_STATUS_DONE {
                return Ok(false);
            }
        }
        if now_ms.wrapping_sub(self.last_time_ms) < self.sample_time_ms as u64 {
            return Ok(false);
        }

        let input = memory.load_rational(self.input)?;
        let setpoint = memory.load_rational(self.setpoint)?;
        let error = setpoint - input;
        self.i_sum = (self.i_sum + self.ki * error).clamp_to(self.out_min, self.out_max);
        let d_input = input - self.last_input;
        let output =
            (self.kp * error + self.i_sum - self.kd * d_input).clamp_to(self.out_min, self.out_max);
        memory.store_rational(self.output, output)?;

        self.last_input = input;
        self.last_time_ms = now_ms;
        Ok(true)
    }

    /// Negative gains are ignored.
    pub fn set_tunings(&mut self, kp: R, ki: R, kd: R) {
        let zero = R::zero();
        if kp < zero || ki < zero || kd < zero {
            return;
        }
        let period_sec = self.sample_time_ms as f64 / 1000.0;
        self.kp = kp;
        self.ki = R::from_f64(ki.to_f64() * period_sec);
        self.kd = R::from_f64(kd.to_f64() / period_sec);
        if self.direction == PidDirection::Reverse {
            self.kp = -self.kp;
            self.ki = -self.ki;
            self.kd = -self.kd;
        }
    }

    /// Rescales the stored ki/kd to a new period; zero is ignored.
    pub fn set_sample_time(&mut self, sample_time_ms: u32) {
        if sample_time_ms == 0 {
            return;
        }
        let ratio = sample_time_ms as f64 / self.sample_time_ms as f64;
        self.ki = R::from_f64(self.ki.to_f64() * ratio);
        self.kd = R::from_f64(self.kd.to_f64() / ratio);
        self.sample_time_ms = sample_time_ms;
    }

    /// No-op unless `min < max`. In automatic mode the live output and the
    /// accumulator are re-clamped.
    pub fn set_output_limits(&mut self, memory: &Memory<R>, min: R, max: R) -> Result<()> {
        if min >= max {
            return Ok(());
        }
        self.out_min = min;
        self.out_max = max;
        if self.mode == PidMode::Automatic {
            let output = memory.load_rational(self.output)?;
            let clamped = output.clamp_to(min, max);
            if clamped != output {
                memory.store_rational(self.output, clamped)?;
            }
            self.i_sum = self.i_sum.clamp_to(min, max);
        }
        Ok(())
    }

    pub fn set_mode(&mut self, memory: &Memory<R>, mode: PidMode) -> Result<()> {
        if mode == PidMode::Automatic && self.mode == PidMode::Manual && self.initialized {
            self.initialize(memory)?;
        }
        self.mode = mode;
        Ok(())
    }

    // Bump-less transfer: continue from the live output and input.
    fn initialize(&mut self, memory: &Memory<R>) -> Result<()> {
        self.i_sum = memory
            .load_rational(self.output)?
            .clamp_to(self.out_min, self.out_max);
        self.last_input = memory.load_rational(self.input)?;
        Ok(())
    }

    pub fn set_controller_direction(&mut self, direction: PidDirection) {
        if self.mode == PidMode::Automatic && direction != self.direction {
            self.kp = -self.kp;
            self.ki = -self.ki;
            self.kd = -self.kd;
        }
        self.direction = direction;
    }

    pub fn clear(&mut self) {
        self.initialized = false;
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn kp(&self) -> R {
        self.kp
    }

    pub fn ki(&self) -> R {
        self.ki
    }

    pub fn kd(&self) -> R {
        self.kd
    }

    pub fn mode(&self) -> PidMode {
        self.mode
    }

    pub fn direction(&self) -> PidDirection {
        self.direction
    }

    pub fn lower_limit(&self) -> R {
        self.out_min
    }

    pub fn upper_limit(&self) -> R {
        self.out_max
    }

    pub fn sample_time(&self) -> u32 {
        self.sample_time_ms
    }

    pub fn integral(&self) -> R {
        self.i_sum
    }

    pub fn map_id(&self) -> Option<u8> {
        self.map_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// `mode << 4 | initialized`, as reported to status readers.
    pub fn status_byte(&self) -> u8 {
        ((self.mode as u8) << 4) | self.initialized as u8
    }
}

/// Fixed set of controllers sharing one memory and clock. Each controller has
/// its own lock so the ticker and the VM never block on unrelated ids.
pub struct PidBank<R: Rational = DefaultRational> {
    controllers: Vec<Mutex<PidController<R>>>,
    memory: Arc<Memory<R>>,
    clock: Arc<dyn Clock>,
}

impl<R: Rational> PidBank<R> {
    pub fn new(count: usize, memory: Arc<Memory<R>>, clock: Arc<dyn Clock>) -> Self {
        let count = count.min(u8::MAX as usize + 1);
        Self {
            controllers: (0..count)
                .map(|id| Mutex::new(PidController::new(id as u8)))
                .collect(),
            memory,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    fn slot(&self, id: u8) -> Result<&Mutex<PidController<R>>> {
        self.controllers
            .get(id as usize)
            .ok_or(VmError::IdUnavailable {
                kind: IdKind::Pid,
                id,
            })
    }

    pub fn init(&self, id: u8, config: &PidConfig<R>) -> Result<()> {
        let now = self.clock.now_millis();
        self.slot(id)?.lock().init(&self.memory, config, now)?;
        info!(id, input = config.input, output = config.output, "pid initialized");
        Ok(())
    }

    pub fn clear(&self, id: u8) -> Result<()> {
        self.slot(id)?.lock().clear();
        Ok(())
    }

    pub fn set_mode(&self, id: u8, mode: PidMode) -> Result<()> {
        self.slot(id)?.lock().set_mode(&self.memory, mode)
    }

    pub fn set_output_limits(&self, id: u8, min: R, max: R) -> Result<()> {
        self.slot(id)?
            .lock()
            .set_output_limits(&self.memory, min, max)
    }

    pub fn set_controller_direction(&self, id: u8, direction: PidDirection) -> Result<()> {
        self.slot(id)?.lock().set_controller_direction(direction);
        Ok(())
    }

    pub fn set_tunings(&self, id: u8, kp: R, ki: R, kd: R) -> Result<()> {
        self.slot(id)?.lock().set_tunings(kp, ki, kd);
        Ok(())
    }

    pub fn set_sample_time(&self, id: u8, sample_time_ms: u32) -> Result<()> {
        self.slot(id)?.lock().set_sample_time(sample_time_ms);
        Ok(())
    }

    pub fn compute(&self, id: u8) -> Result<bool> {
        let now = self.clock.now_millis();
        self.slot(id)?.lock().compute(&self.memory, now)
    }

    /// Ticks every controller; returns how many wrote a new output.
    pub fn compute_all(&self) -> usize {
        let now = self.clock.now_millis();
        let mut written = 0;
        for slot in &self.controllers {
            let mut controller = slot.lock();
            match controller.compute(&self.memory, now) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(err) => debug!(id = controller.id(), %err, "pid compute failed"),
            }
        }
        written
    }

    pub fn clear_all(&self) {
        self.controllers
            .iter()
            .for_each(|slot| slot.lock().clear());
    }

    /// Copy of one controller's state.
    pub fn snapshot(&self, id: u8) -> Result<PidController<R>> {
        Ok(self.slot(id)?.lock().clone())
    }

    /// `count` followed by one `mode << 4 | initialized` byte per controller.
    pub fn status_report(&self) -> Vec<u8> {
        let mut report = Vec::with_capacity(self.controllers.len() + 1);
        report.push(self.controllers.len() as u8);
        report.extend(self.controllers.iter().map(|slot| slot.lock().status_byte()));
        report
    }

    pub fn memory(&self) -> &Arc<Memory<R>> {
        &self.memory
    }
}
