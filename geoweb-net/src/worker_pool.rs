//! Bounded pool of message-processing threads.
//!
//! Read loops never run protocol logic themselves; they hand each decoded
//! control payload to this pool.  Workers are spawned lazily up to
//! `max_workers` and exit again after `keep_alive` without work, so an idle
//! node holds no processing threads.  Tasks queue in an unbounded crossbeam
//! channel when every worker is busy.

use {
    crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender},
    log::{error, trace, warn},
    parking_lot::Mutex,
    std::{
        panic::{self, AssertUnwindSafe},
        sync::Arc,
        thread,
        time::Duration,
    },
};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PoolState {
    live: usize,
    idle: usize,
}

pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    state: Arc<Mutex<PoolState>>,
    max_workers: usize,
    keep_alive: Duration,
}

impl WorkerPool {
    pub fn new(name: &str, max_workers: usize, keep_alive: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            receiver,
            state: Arc::new(Mutex::new(PoolState::default())),
            max_workers: max_workers.max(1),
            keep_alive,
        }
    }

    /// Queue `task`.  Returns `false` once the pool has been shut down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        let mut state = self.state.lock();
        if sender.send(Box::new(task)).is_err() {
            return false;
        }
        if state.idle == 0 && state.live < self.max_workers {
            self.spawn_worker(&mut state);
        }
        true
    }

    /// Threads currently alive (busy or idle).
    pub fn live_workers(&self) -> usize {
        self.state.lock().live
    }

    /// Stop accepting work.  Already queued tasks still run; workers exit
    /// once the queue is drained.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    fn spawn_worker(&self, state: &mut PoolState) {
        let receiver = self.receiver.clone();
        let shared = self.state.clone();
        let keep_alive = self.keep_alive;
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || Self::run(&receiver, &shared, keep_alive));
        match spawned {
            Ok(_) => state.live = state.live.saturating_add(1),
            Err(e) => warn!("{}: failed to spawn worker: {}", self.name, e),
        }
    }

    fn run(receiver: &Receiver<Task>, state: &Mutex<PoolState>, keep_alive: Duration) {
        loop {
            {
                let mut state = state.lock();
                state.idle = state.idle.saturating_add(1);
            }
            match receiver.recv_timeout(keep_alive) {
                Ok(task) => {
                    {
                        let mut state = state.lock();
                        state.idle = state.idle.saturating_sub(1);
                    }
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("worker task panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = state.lock();
                    state.idle = state.idle.saturating_sub(1);
                    // a task queued while we timed out must not be stranded
                    if !receiver.is_empty() {
                        continue;
                    }
                    state.live = state.live.saturating_sub(1);
                    trace!("idle worker exiting");
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let mut state = state.lock();
                    state.idle = state.idle.saturating_sub(1);
                    state.live = state.live.saturating_sub(1);
                    return;
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
