//! Host threads around the core: the VM stepping loop and the PID ticker.

use crate::error::RuntimeError;
use crate::pid::PidBank;
use crate::rational::{DefaultRational, Rational};
use crate::vm::Vm;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

const VM_THREAD: &str = "calcvm-vm";
const PID_THREAD: &str = "calcvm-pid";

#[derive(Debug)]
pub enum VmCommand {
    Run,
    Stop,
    /// Rewind to address 0 and run.
    Restart,
    Status(Sender<u32>),
    /// Store a new program and stay stopped.
    Load(Vec<u8>),
    Shutdown,
}

/// Owns a [`Vm`] on its own thread. Idle (stopped or halted) runners block on
/// the command channel.
pub struct VmRunner<R: Rational = DefaultRational> {
    commands: Sender<VmCommand>,
    handle: Option<JoinHandle<Vm<R>>>,
}

impl<R: Rational> VmRunner<R> {
    pub fn spawn(vm: Vm<R>, step_pause: Duration) -> Result<Self, RuntimeError> {
        let (commands, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(VM_THREAD.into())
            .spawn(move || run_loop(vm, receiver, step_pause))
            .map_err(|err| RuntimeError::Spawn(VM_THREAD, err))?;
        Ok(Self {
            commands,
            handle: Some(handle),
        })
    }

    pub fn send(&self, command: VmCommand) -> Result<(), RuntimeError> {
        self.commands
            .send(command)
            .map_err(|_| RuntimeError::Disconnected(VM_THREAD))
    }

    pub fn run(&self) -> Result<(), RuntimeError> {
        self.send(VmCommand::Run)
    }

    pub fn stop(&self) -> Result<(), RuntimeError> {
        self.send(VmCommand::Stop)
    }

    pub fn restart(&self) -> Result<(), RuntimeError> {
        self.send(VmCommand::Restart)
    }

    pub fn load(&self, program: Vec<u8>) -> Result<(), RuntimeError> {
        self.send(VmCommand::Load(program))
    }

    /// Current status word.
    pub fn status(&self) -> Result<u32, RuntimeError> {
        let (reply, answer) = mpsc::channel();
        self.send(VmCommand::Status(reply))?;
        answer
            .recv()
            .map_err(|_| RuntimeError::Disconnected(VM_THREAD))
    }

    /// Stops the thread and hands the VM back.
    pub fn shutdown(mut self) -> Result<Vm<R>, RuntimeError> {
        let _ = self.commands.send(VmCommand::Shutdown);
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .ok_or(RuntimeError::Disconnected(VM_THREAD))
    }
}

impl<R: Rational> Drop for VmRunner<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(VmCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

fn run_loop<R: Rational>(mut vm: Vm<R>, commands: Receiver<VmCommand>, pause: Duration) -> Vm<R> {
    let mut running = false;
    let mut reported = false;
    loop {
        let command = if running && !vm.is_halted() {
            match commands.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        };

        match command {
            Some(VmCommand::Run) => {
                running = true;
                info!(pc = vm.pc(), "vm running");
            }
            Some(VmCommand::Stop) => {
                running = false;
                info!(pc = vm.pc(), "vm stopped");
            }
            Some(VmCommand::Restart) => {
                vm.clear();
                reported = false;
                running = true;
                info!("vm restarted");
            }
            Some(VmCommand::Status(reply)) => {
                let _ = reply.send(vm.status());
            }
            Some(VmCommand::Load(program)) => {
                running = false;
                reported = false;
                if let Err(err) = vm.load_program(&program) {
                    warn!(len = program.len(), %err, "program load failed");
                }
            }
            Some(VmCommand::Shutdown) => break,
            None => {
                let _ = vm.step();
                if vm.has_error() && !reported {
                    reported = true;
                    warn!(status = format_args!("0x{:08X}", vm.status()), "vm halted with error");
                }
                if !pause.is_zero() {
                    thread::sleep(pause);
                }
            }
        }
    }
    info!("vm thread exiting");
    vm
}

/// Calls [`PidBank::compute_all`] every `interval` until shut down.
pub struct PidTicker {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PidTicker {
    pub fn spawn<R: Rational>(
        pids: Arc<PidBank<R>>,
        interval: Duration,
    ) -> Result<Self, RuntimeError> {
        let (stop, receiver) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(PID_THREAD.into())
            .spawn(move || loop {
                match receiver.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        pids.compute_all();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|err| RuntimeError::Spawn(PID_THREAD, err))?;
        info!(interval_ms = interval.as_millis() as u64, "pid ticker started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for PidTicker {
    fn drop(&mut self) {
        self.stop_thread();
    }
}
