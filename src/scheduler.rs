//! Tick-stamped command scheduling.
//!
//! The sequencer never owns a timer. It posts boxed commands against a
//! [`Scheduler`] and keeps a [`ScheduledCommand`] handle for each one it may
//! need to cancel or flush. [`TickScheduler`] is the in-process
//! implementation: a queue ordered by tick that is drained by whoever owns the
//! clock (a GUI timer, a MIDI clock follower, an offline render loop, a test).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::lock;

/// A deferred action. Receives the tick it was scheduled for.
pub type Command = Box<dyn FnOnce(u64) + Send>;

/// Identifies a posted command. Ids are unique per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

/// Clock and timer queue consumed by the sequencer.
pub trait Scheduler: Send + Sync {
    /// Current tick. Never decreases.
    fn current_tick(&self) -> u64;

    /// Queue `command` to run at `tick`. A tick already in the past runs on
    /// the next dispatch pass.
    fn post_at_tick(&self, tick: u64, command: Command) -> CommandId;

    /// Drop a pending command. No-op if it already ran or was cancelled.
    fn cancel(&self, id: CommandId);

    /// Run a pending command immediately on the calling thread.
    ///
    /// Returns `false` if the command already ran or was cancelled.
    fn execute_now(&self, id: CommandId) -> bool;
}

pub type SharedScheduler = Arc<dyn Scheduler>;

/// Owned handle to a posted command.
///
/// Dropping the handle cancels the command if it is still pending, so a
/// sequencer that forgets a handle cannot leave a stray callback behind.
pub struct ScheduledCommand {
    id: CommandId,
    tick: u64,
    scheduler: Weak<dyn Scheduler>,
}

impl ScheduledCommand {
    pub fn post(scheduler: &SharedScheduler, tick: u64, command: Command) -> Self {
        let id = scheduler.post_at_tick(tick, command);
        Self {
            id,
            tick,
            scheduler: Arc::downgrade(scheduler),
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn cancel(self) {
        // Drop does the work
    }

    /// Run the command now if it has not fired yet.
    pub fn execute_now(self) -> bool {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.execute_now(self.id),
            None => false,
        }
    }
}

impl Drop for ScheduledCommand {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.cancel(self.id);
        }
    }
}

impl fmt::Debug for ScheduledCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledCommand")
            .field("id", &self.id)
            .field("tick", &self.tick)
            .finish()
    }
}

struct Queue {
    now: u64,
    next_id: u64,
    /// Keyed by (tick, id) so equal ticks run in post order
    entries: BTreeMap<(u64, u64), Command>,
    ticks: HashMap<u64, u64>,
}

impl Queue {
    fn take(&mut self, id: CommandId) -> Option<(u64, Command)> {
        let tick = self.ticks.remove(&id.0)?;
        self.entries.remove(&(tick, id.0)).map(|cmd| (tick, cmd))
    }

    fn pop_due(&mut self, until: u64) -> Option<(u64, Command)> {
        let (&(tick, id), _) = self.entries.first_key_value()?;
        if tick > until {
            return None;
        }
        self.ticks.remove(&id);
        self.now = self.now.max(tick);
        self.entries.remove(&(tick, id)).map(|cmd| (tick, cmd))
    }
}

/// Deterministic tick scheduler.
///
/// Commands run on the thread calling [`advance_to`](Self::advance_to), one
/// at a time, with the queue unlocked so they can post and cancel freely.
pub struct TickScheduler {
    queue: Mutex<Queue>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(tick: u64) -> Self {
        Self {
            queue: Mutex::new(Queue {
                now: tick,
                next_id: 0,
                entries: BTreeMap::new(),
                ticks: HashMap::new(),
            }),
        }
    }

    pub fn now(&self) -> u64 {
        lock(&self.queue).now
    }

    /// Number of commands waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.queue).entries.len()
    }

    /// Tick of the earliest pending command.
    pub fn next_due(&self) -> Option<u64> {
        lock(&self.queue)
            .entries
            .first_key_value()
            .map(|(&(tick, _), _)| tick)
    }

    /// Run every command due at or before `tick`, then move the clock there.
    ///
    /// Commands posted during the pass for ticks <= `tick` run in the same
    /// pass. Returns the number of commands run.
    pub fn advance_to(&self, tick: u64) -> usize {
        let mut ran = 0;
        loop {
            let due = lock(&self.queue).pop_due(tick);
            match due {
                Some((at, command)) => {
                    command(at);
                    ran += 1;
                }
                None => break,
            }
        }
        let mut queue = lock(&self.queue);
        queue.now = queue.now.max(tick);
        ran
    }

    pub fn advance_by(&self, ticks: u64) -> usize {
        let target = self.now().saturating_add(ticks);
        self.advance_to(target)
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TickScheduler {
    fn current_tick(&self) -> u64 {
        self.now()
    }

    fn post_at_tick(&self, tick: u64, command: Command) -> CommandId {
        let mut queue = lock(&self.queue);
        let id = queue.next_id;
        queue.next_id += 1;
        queue.entries.insert((tick, id), command);
        queue.ticks.insert(id, tick);
        CommandId(id)
    }

    fn cancel(&self, id: CommandId) {
        let removed = lock(&self.queue).take(id);
        // Dropped outside the lock: a command's captures may touch the scheduler
        drop(removed);
    }

    fn execute_now(&self, id: CommandId) -> bool {
        let taken = lock(&self.queue).take(id);
        match taken {
            Some((tick, command)) => {
                command(tick);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<(u64, &'static str)>>>, impl Fn(&'static str) -> Command) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &'static str| -> Command {
            let sink = Arc::clone(&sink);
            Box::new(move |tick| sink.lock().unwrap().push((tick, label)))
        };
        (log, make)
    }

    #[test]
    fn test_commands_run_in_tick_order() {
        let sched = TickScheduler::new();
        let (log, cmd) = recorder();
        sched.post_at_tick(20, cmd("b"));
        sched.post_at_tick(10, cmd("a"));
        sched.post_at_tick(30, cmd("c"));

        assert_eq!(sched.advance_to(25), 2);
        assert_eq!(*log.lock().unwrap(), vec![(10, "a"), (20, "b")]);
        assert_eq!(sched.now(), 25);
        assert_eq!(sched.pending(), 1);
        assert_eq!(sched.next_due(), Some(30));
    }

    #[test]
    fn test_same_tick_runs_in_post_order() {
        let sched = TickScheduler::new();
        let (log, cmd) = recorder();
        sched.post_at_tick(5, cmd("first"));
        sched.post_at_tick(5, cmd("second"));
        sched.advance_to(5);
        assert_eq!(*log.lock().unwrap(), vec![(5, "first"), (5, "second")]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let sched = TickScheduler::new();
        let (log, cmd) = recorder();
        let id = sched.post_at_tick(10, cmd("x"));
        sched.cancel(id);
        sched.cancel(id);
        sched.advance_to(100);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_execute_now_runs_once() {
        let sched = TickScheduler::new();
        let (log, cmd) = recorder();
        let id = sched.post_at_tick(40, cmd("off"));
        assert!(sched.execute_now(id));
        assert!(!sched.execute_now(id));
        sched.advance_to(100);
        assert_eq!(*log.lock().unwrap(), vec![(40, "off")]);
    }

    #[test]
    fn test_command_posted_during_dispatch_runs_same_pass() {
        let sched = Arc::new(TickScheduler::new());
        let (log, cmd) = recorder();
        let inner = cmd("inner");
        let weak = Arc::downgrade(&sched);
        sched.post_at_tick(
            10,
            Box::new(move |tick| {
                if let Some(s) = weak.upgrade() {
                    s.post_at_tick(tick + 5, inner);
                }
            }),
        );
        assert_eq!(sched.advance_to(20), 2);
        assert_eq!(*log.lock().unwrap(), vec![(15, "inner")]);
    }

    #[test]
    fn test_clock_is_visible_during_dispatch() {
        let sched = Arc::new(TickScheduler::new());
        let seen = Arc::new(Mutex::new(None));
        let (weak, out) = (Arc::downgrade(&sched), Arc::clone(&seen));
        sched.post_at_tick(
            42,
            Box::new(move |_| {
                *out.lock().unwrap() = weak.upgrade().map(|s| s.current_tick());
            }),
        );
        sched.advance_to(100);
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let sched = TickScheduler::starting_at(500);
        sched.advance_to(100);
        assert_eq!(sched.now(), 500);
        sched.advance_by(10);
        assert_eq!(sched.now(), 510);
    }

    #[test]
    fn test_scheduled_command_cancels_on_drop() {
        let sched: SharedScheduler = Arc::new(TickScheduler::new());
        let (log, cmd) = recorder();
        {
            let _handle = ScheduledCommand::post(&sched, 10, cmd("dropped"));
        }
        let kept = ScheduledCommand::post(&sched, 10, cmd("kept"));
        assert_eq!(kept.tick(), 10);
        assert!(sched.execute_now(kept.id()));
        assert_eq!(*log.lock().unwrap(), vec![(10, "kept")]);
    }

    #[test]
    fn test_scheduled_command_execute_now() {
        let sched: SharedScheduler = Arc::new(TickScheduler::new());
        let (log, cmd) = recorder();
        let handle = ScheduledCommand::post(&sched, 99, cmd("flush"));
        assert!(handle.execute_now());
        assert_eq!(*log.lock().unwrap(), vec![(99, "flush")]);
    }
}
