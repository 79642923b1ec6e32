//! Dedicated simulation thread
//!
//! The engine is owned by one OS thread. Everything else talks to it by
//! queueing closures that run in FIFO order. `flush` resolves once every job
//! queued before it has run.

use crate::engine::PhysicsEngine;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&mut dyn PhysicsEngine) + Send + 'static>;

enum Command {
    Run(Job),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable sender side of the simulation queue
#[derive(Clone)]
pub struct SimulationHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SimulationHandle {
    /// Queue a job. Returns false once the simulation thread has stopped.
    ///
    /// A job accepted here always runs, even if shutdown was requested first.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut dyn PhysicsEngine) + Send + 'static,
    {
        self.tx.send(Command::Run(Box::new(job))).is_ok()
    }

    /// Run a job and wait for its result
    ///
    /// Must not be called from the simulation thread itself or from inside an
    /// async context.
    pub fn call<F, R>(&self, job: F) -> Option<R>
    where
        F: FnOnce(&mut dyn PhysicsEngine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.execute(move |engine| {
            let _ = tx.send(job(engine));
        });
        if !queued {
            return None;
        }
        rx.blocking_recv().ok()
    }

    /// Resolves after every job queued before this call has run
    ///
    /// The receiver yields an error if the thread stopped first.
    pub fn flush(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        // On failure the sender is dropped with the command and the receiver errors
        let _ = self.tx.send(Command::Flush(tx));
        rx
    }

    /// Blocking variant of [`SimulationHandle::flush`]
    pub fn flush_blocking(&self) -> bool {
        self.flush().blocking_recv().is_ok()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

fn run(command: Command, engine: &mut dyn PhysicsEngine) {
    match command {
        Command::Run(job) => {
            if panic::catch_unwind(AssertUnwindSafe(|| job(engine))).is_err() {
                tracing::error!("simulation job panicked");
            }
        }
        Command::Flush(done) => {
            let _ = done.send(());
        }
        Command::Shutdown => {}
    }
}

/// Owner of the simulation thread
pub struct SimulationThread {
    handle: SimulationHandle,
    join: Option<JoinHandle<Box<dyn PhysicsEngine>>>,
}

impl SimulationThread {
    pub fn spawn(mut engine: Box<dyn PhysicsEngine>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        let join = thread::Builder::new()
            .name("physics-sim".to_string())
            .spawn(move || {
                tracing::debug!("simulation thread started");
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        Command::Shutdown => break,
                        command => run(command, engine.as_mut()),
                    }
                }
                // Refuse new work, then finish whatever was accepted before the close
                rx.close();
                let mut drained = 0usize;
                while let Ok(command) = rx.try_recv() {
                    if !matches!(command, Command::Shutdown) {
                        run(command, engine.as_mut());
                        drained += 1;
                    }
                }
                if drained > 0 {
                    tracing::debug!(drained, "ran jobs queued behind shutdown");
                }
                tracing::debug!("simulation thread stopped");
                engine
            })?;

        Ok(Self {
            handle: SimulationHandle { tx },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> SimulationHandle {
        self.handle.clone()
    }

    /// Stop after the jobs already queued and hand the engine back
    pub fn shutdown(mut self) -> Option<Box<dyn PhysicsEngine>> {
        self.stop()
    }

    fn stop(&mut self) -> Option<Box<dyn PhysicsEngine>> {
        let join = self.join.take()?;
        let _ = self.handle.tx.send(Command::Shutdown);
        match join.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                tracing::error!("simulation thread panicked");
                None
            }
        }
    }
}

impl Drop for SimulationThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
