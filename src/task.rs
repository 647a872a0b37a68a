//! A generic periodic background task. Each sync/flush task runs its work
//! cycle on its own named OS thread, sleeping between cycles, with prompt
//! graceful stop and out-of-band forced runs.
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

/// A unit of periodic work driven by a [`PeriodicTask`].
pub trait TaskWork: Send + 'static {
    /// One synchronization cycle. Runs immediately on task start and then
    /// once per interval. Must not panic under normal operation; failures
    /// are expected to be logged and swallowed so the task keeps running.
    fn cycle(&mut self);

    /// Called once after the last cycle, before the task thread exits. Used
    /// for best-effort final work such as a last telemetry flush.
    fn on_stop(&mut self) {}
}

enum Command {
    ForceRun,
    Stop(Option<SyncSender<()>>),
}

struct TaskHandle {
    sender: Sender<Command>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

/// A periodic background task.
///
/// The task runs [`TaskWork::cycle`] on a dedicated thread once per interval
/// (minus a randomized jitter, to keep fleets of clients from synchronizing
/// their polls). [`PeriodicTask::stop`] interrupts the between-cycles sleep
/// promptly but never interrupts a cycle already in flight: the cycle
/// completes, [`TaskWork::on_stop`] runs, and only then does the thread exit.
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    jitter: Duration,
    work: Arc<Mutex<dyn TaskWork>>,
    /// True while the task thread is actually alive, not merely requested to
    /// start.
    running: Arc<AtomicBool>,
    control: Mutex<Option<TaskHandle>>,
}

impl PeriodicTask {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        jitter: Duration,
        work: impl TaskWork,
    ) -> PeriodicTask {
        PeriodicTask {
            name: name.into(),
            interval,
            jitter,
            work: Arc::new(Mutex::new(work)),
            running: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(None),
        }
    }

    /// Start the task thread. Starting a task that is already running is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the task thread failed to spawn.
    pub fn start(&self) -> std::io::Result<()> {
        let mut control = self
            .control
            .lock()
            .expect("thread holding task control lock should not panic");
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let (sender, receiver) = std::sync::mpsc::channel::<Command>();
        let running = Arc::clone(&self.running);
        let work = Arc::clone(&self.work);
        let interval = self.interval;
        let jitter_limit = self.jitter;
        let name = self.name.clone();

        // Set before spawning, under the control lock, so a racing second
        // start() cannot spawn a duplicate thread. The thread resets it on
        // exit.
        running.store(true, Ordering::Release);

        let spawned = std::thread::Builder::new()
            .name(format!("flagsync-{name}"))
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_loop(&receiver, &work, interval, jitter_limit)
                }));

                running.store(false, Ordering::Release);

                match result {
                    Ok(stop_signal) => {
                        // Fire any stop signals that raced with the exit, so
                        // no caller is left waiting.
                        let mut signals: Vec<SyncSender<()>> =
                            stop_signal.into_iter().collect();
                        while let Ok(command) = receiver.try_recv() {
                            if let Command::Stop(Some(signal)) = command {
                                signals.push(signal);
                            }
                        }
                        for signal in signals {
                            let _ = signal.try_send(());
                        }
                    }
                    Err(_panic_info) => {
                        log::error!(target: "flagsync", task = name.as_str(); "task panicked");
                    }
                }
            });

        match spawned {
            Ok(join_handle) => {
                *control = Some(TaskHandle {
                    sender,
                    join_handle: Some(join_handle),
                });
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Request graceful termination. Does not wait for the in-flight cycle
    /// to finish. Stopping a stopped task is a no-op.
    pub fn stop(&self) {
        self.send_stop(None);
    }

    /// Request graceful termination; `signal` is notified only after the
    /// in-flight cycle (if any) completes and the task thread has exited.
    /// If the task is already stopped, the signal fires immediately.
    pub fn stop_with_signal(&self, signal: SyncSender<()>) {
        self.send_stop(Some(signal));
    }

    fn send_stop(&self, signal: Option<SyncSender<()>>) {
        let mut control = self
            .control
            .lock()
            .expect("thread holding task control lock should not panic");
        let Some(handle) = control.as_mut() else {
            if let Some(signal) = signal {
                let _ = signal.try_send(());
            }
            return;
        };

        let delivered = handle.sender.send(Command::Stop(signal.clone())).is_ok();
        if delivered && self.running.load(Ordering::Acquire) {
            // If the thread was still running at this point, the command
            // landed before its final channel drain; the thread fires the
            // signal once it exits.
            return;
        }

        // The thread has exited (or is past reading its channel), so the
        // command may never be received. Wait for the thread to fully
        // terminate, then fire the signal here; if the thread did fire it,
        // the duplicate send is rejected by the full buffer and ignored.
        if let Some(join_handle) = handle.join_handle.take() {
            let _ = join_handle.join();
        }
        if let Some(signal) = signal {
            let _ = signal.try_send(());
        }
    }

    /// Run one cycle now, out of band. The next scheduled cycle keeps its
    /// original timing. No-op if the task is not running.
    pub fn force_run(&self) {
        let control = self
            .control
            .lock()
            .expect("thread holding task control lock should not panic");
        if let Some(handle) = control.as_ref() {
            let _ = handle.sender.send(Command::ForceRun);
        }
    }

    /// Whether the task thread is currently alive. Reflects actual execution
    /// state: after a stop this turns false only once the thread has exited.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Body of the task thread. Returns the completion signal of the stop
/// command that terminated the loop, if any.
fn run_loop(
    receiver: &Receiver<Command>,
    work: &Mutex<dyn TaskWork>,
    interval: Duration,
    jitter_limit: Duration,
) -> Option<SyncSender<()>> {
    let run_cycle = || {
        work.lock()
            .expect("thread holding task work lock should not panic")
            .cycle();
    };

    loop {
        run_cycle();

        let deadline = Instant::now() + jitter(interval, jitter_limit);
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    // Timed out. Loop back to run the next scheduled cycle.
                    break;
                }
                Ok(Command::ForceRun) => {
                    // Out-of-band cycle; the deadline intentionally stays
                    // put so forced runs don't shift the schedule.
                    run_cycle();
                }
                Ok(Command::Stop(signal)) => {
                    log::debug!(target: "flagsync", "task received stop command");
                    work.lock()
                        .expect("thread holding task work lock should not panic")
                        .on_stop();
                    return signal;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // All senders dropped; the owning PeriodicTask is gone.
                    log::debug!(target: "flagsync", "task control channel disconnected");
                    work.lock()
                        .expect("thread holding task work lock should not panic")
                        .on_stop();
                    return None;
                }
            }
        }
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

/// A one-shot latch used to signal that the initial cache population has
/// completed. Setting it twice is a no-op.
#[derive(Clone, Default)]
pub struct ReadySignal(Arc<(Mutex<bool>, Condvar)>);

impl ReadySignal {
    pub fn new() -> ReadySignal {
        ReadySignal::default()
    }

    /// Fire the signal. Idempotent.
    pub fn set(&self) {
        let mut ready = self
            .0
             .0
            .lock()
            .expect("thread holding ready lock should not panic");
        if !*ready {
            *ready = true;
            self.0 .1.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *self
            .0
             .0
            .lock()
            .expect("thread holding ready lock should not panic")
    }

    /// Block until the signal fires or `timeout` elapses. Returns whether
    /// the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self
            .0
             .0
            .lock()
            .expect("thread holding ready lock should not panic");
        while !*ready {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _timeout_result) = self
                .0
                 .1
                .wait_timeout(ready, remaining)
                .expect("thread holding ready lock should not panic");
            ready = guard;
        }
        true
    }
}

/// Timestamp (epoch milliseconds) of the last successful fetch performed by
/// a sync task. Shared between the task and health probes.
#[derive(Clone, Default)]
pub struct FetchStamp(Arc<AtomicI64>);

impl FetchStamp {
    pub fn new() -> FetchStamp {
        FetchStamp::default()
    }

    /// Record a successful fetch at the current time.
    pub fn mark(&self) {
        self.0
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Epoch milliseconds of the last successful fetch, `None` if no fetch
    /// has succeeded yet.
    pub fn get(&self) -> Option<i64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            millis => Some(millis),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::sync_channel;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    struct CountingWork {
        cycles: Arc<AtomicUsize>,
        cycle_duration: Duration,
        cycle_completed: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    impl CountingWork {
        fn new() -> CountingWork {
            CountingWork {
                cycles: Arc::new(AtomicUsize::new(0)),
                cycle_duration: Duration::ZERO,
                cycle_completed: Arc::new(AtomicBool::new(false)),
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl TaskWork for CountingWork {
        fn cycle(&mut self) {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            self.cycle_completed.store(false, Ordering::SeqCst);
            std::thread::sleep(self.cycle_duration);
            self.cycle_completed.store(true, Ordering::SeqCst);
        }

        fn on_stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    const LONG_INTERVAL: Duration = Duration::from_secs(3600);

    #[test]
    fn first_cycle_runs_immediately() {
        let work = CountingWork::new();
        let cycles = Arc::clone(&work.cycles);
        let task = PeriodicTask::new("test", LONG_INTERVAL, Duration::ZERO, work);

        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        assert!(task.is_running());
        task.stop();
    }

    #[test]
    fn start_is_idempotent() {
        let work = CountingWork::new();
        let cycles = Arc::clone(&work.cycles);
        let task = PeriodicTask::new("test", LONG_INTERVAL, Duration::ZERO, work);

        task.start().unwrap();
        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));

        // A duplicate thread would have run a second immediate cycle.
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        task.stop();
    }

    #[test]
    fn force_run_does_an_immediate_cycle() {
        let work = CountingWork::new();
        let cycles = Arc::clone(&work.cycles);
        let task = PeriodicTask::new("test", LONG_INTERVAL, Duration::ZERO, work);

        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        task.force_run();
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(cycles.load(Ordering::SeqCst), 2);
        task.stop();
    }

    #[test]
    fn stop_waits_for_inflight_cycle() {
        let mut work = CountingWork::new();
        work.cycle_duration = Duration::from_millis(300);
        let cycle_completed = Arc::clone(&work.cycle_completed);
        let stopped = Arc::clone(&work.stopped);
        let task = PeriodicTask::new("test", LONG_INTERVAL, Duration::ZERO, work);

        task.start().unwrap();
        // Let the first (slow) cycle get in flight.
        std::thread::sleep(Duration::from_millis(50));

        let (signal, done) = sync_channel(1);
        task.stop_with_signal(signal);
        done.recv_timeout(Duration::from_secs(5))
            .expect("task should stop");

        assert!(cycle_completed.load(Ordering::SeqCst));
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!task.is_running());
    }

    #[test]
    fn stop_on_stopped_task_is_a_no_op_and_fires_signal() {
        let task = PeriodicTask::new("test", LONG_INTERVAL, Duration::ZERO, CountingWork::new());

        let (signal, done) = sync_channel(1);
        task.stop_with_signal(signal);

        done.recv_timeout(Duration::from_secs(1))
            .expect("signal should fire for a never-started task");
        assert!(!task.is_running());

        // And again after a full start/stop round.
        task.start().unwrap();
        let (signal, done) = sync_channel(1);
        task.stop_with_signal(signal);
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        let (signal, done) = sync_channel(1);
        task.stop_with_signal(signal);
        done.recv_timeout(Duration::from_secs(1))
            .expect("signal should fire for an already-stopped task");
    }

    #[test]
    fn racing_stops_always_fire_their_signals() {
        // A stop whose command lands just as the thread exits must not leave
        // the caller waiting: the stop path joins the exited thread and fires
        // the signal itself. Repeat to give the race a chance to interleave.
        for _ in 0..50 {
            let task = Arc::new(PeriodicTask::new(
                "test",
                LONG_INTERVAL,
                Duration::ZERO,
                CountingWork::new(),
            ));
            task.start().unwrap();

            let stopper = {
                let task = Arc::clone(&task);
                std::thread::spawn(move || task.stop())
            };
            let (signal, done) = sync_channel(1);
            task.stop_with_signal(signal);

            done.recv_timeout(Duration::from_secs(5))
                .expect("completion signal should fire even when stops race thread exit");
            stopper.join().unwrap();
            assert!(!task.is_running());
        }
    }

    #[test]
    fn can_restart_after_stop() {
        let work = CountingWork::new();
        let cycles = Arc::clone(&work.cycles);
        let task = PeriodicTask::new("test", LONG_INTERVAL, Duration::ZERO, work);

        task.start().unwrap();
        let (signal, done) = sync_channel(1);
        task.stop_with_signal(signal);
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!task.is_running());

        task.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(task.is_running());
        assert_eq!(cycles.load(Ordering::SeqCst), 2);
        task.stop();
    }

    #[test]
    fn ready_signal_is_one_shot_and_idempotent() {
        let ready = ReadySignal::new();
        assert!(!ready.is_set());
        assert!(!ready.wait_timeout(Duration::from_millis(10)));

        ready.set();
        ready.set();

        assert!(ready.is_set());
        assert!(ready.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn ready_signal_wakes_waiter() {
        let ready = ReadySignal::new();
        let waiter = {
            let ready = ready.clone();
            std::thread::spawn(move || ready.wait_timeout(Duration::from_secs(5)))
        };

        std::thread::sleep(Duration::from_millis(50));
        ready.set();

        assert!(waiter.join().unwrap());
    }
}
