use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Waker;
use tracing::{debug, info, trace, warn};

use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::event::{EventKind, Handle, Interest, WAKE_TOKEN};
use crate::handler::EventHandler;
use crate::poll::{HandleResolver, Multiplexer};
use crate::signal::SignalEvent;
use crate::timer::{TimerQueue, TimerTarget};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// A registration change waiting to be applied on the I/O thread.
pub(crate) enum Change {
    Add(Box<dyn EventHandler>, Interest),
    Rearm(Target, Interest),
    Remove(Target),
    Schedule(Target, Duration),
    Timer {
        callback: crate::timer::TimerCallback,
        interval: Duration,
        delay: bool,
        repeats: Option<u32>,
    },
}

/// The event a queued change applies to.
///
/// Changes coming from other threads pin the registration generation they
/// saw, so a change that arrives after the handle was closed and reused is
/// dropped instead of hitting the new owner.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target {
    handle: Handle,
    generation: Option<u64>,
}

impl Target {
    fn any(handle: Handle) -> Self {
        Target {
            handle,
            generation: None,
        }
    }

    fn pinned(handle: Handle, generation: u64) -> Self {
        Target {
            handle,
            generation: Some(generation),
        }
    }
}

/// Changes requested by event handlers while a poll batch is being delivered.
///
/// The reactor applies them in request order once the batch is done.
#[derive(Default)]
pub struct Changes {
    pending: Vec<Change>,
    removed: HashSet<Handle>,
}

impl Changes {
    /// Takes ownership of a new event object and registers it.
    pub fn add(&mut self, event: Box<dyn EventHandler>, interest: Interest) {
        self.pending.push(Change::Add(event, interest));
    }

    /// Re-arms an already registered handle with a new interest mask.
    pub fn rearm(&mut self, handle: Handle, interest: Interest) {
        self.pending.push(Change::Rearm(Target::any(handle), interest));
    }

    /// Unregisters and destroys the event owning `handle`.
    pub fn remove(&mut self, handle: Handle) {
        self.removed.insert(handle);
        self.pending.push(Change::Remove(Target::any(handle)));
    }

    /// Delivers [`EventKind::Timer`] to `handle` once, after `after`.
    pub fn schedule(&mut self, handle: Handle, after: Duration) {
        self.pending.push(Change::Schedule(Target::any(handle), after));
    }

    /// Whether `handle` was queued for removal in the current batch.
    pub fn is_removed(&self, handle: Handle) -> bool {
        self.removed.contains(&handle)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&mut self) -> Vec<Change> {
        self.removed.clear();
        std::mem::take(&mut self.pending)
    }
}

/// Handle-to-event table. The reactor is the only owner of event objects.
#[derive(Default)]
pub(crate) struct EventTable(HashMap<Handle, Box<dyn EventHandler>>);

impl HandleResolver for EventTable {
    fn resolve(&mut self, handle: Handle) -> Option<&mut (dyn EventHandler + 'static)> {
        self.0.get_mut(&handle).map(|event| event.as_mut())
    }
}

/// Cloneable, thread-safe control surface of a [`Reactor`].
///
/// Everything that touches the event table is queued and applied on the I/O
/// thread; the handle only wakes the poll so the queue is picked up promptly.
#[derive(Clone)]
pub struct ReactorHandle {
    commands: Sender<Change>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// Asks the reactor loop to exit after the current iteration.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Interrupts a blocking poll without any other effect.
    pub fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(error = %err, "failed to wake reactor");
        }
    }

    pub fn add_event(&self, event: Box<dyn EventHandler>, interest: Interest) -> Result<()> {
        self.submit(Change::Add(event, interest))
    }

    /// Re-arms the registration of `handle` whose
    /// [`generation`](EventHandler::generation) is `generation`. Ignored if
    /// the handle has since been removed or taken over by another event.
    pub fn rearm(&self, handle: Handle, generation: u64, interest: Interest) -> Result<()> {
        self.submit(Change::Rearm(Target::pinned(handle, generation), interest))
    }

    /// Removes the registration of `handle` with the given generation.
    pub fn remove(&self, handle: Handle, generation: u64) -> Result<()> {
        self.submit(Change::Remove(Target::pinned(handle, generation)))
    }

    pub fn schedule(&self, handle: Handle, generation: u64, after: Duration) -> Result<()> {
        self.submit(Change::Schedule(Target::pinned(handle, generation), after))
    }

    /// Runs `callback` on the I/O thread whenever `signum` is delivered to
    /// the process.
    ///
    /// Deliveries that arrive before the reactor gets to them may be
    /// coalesced into one call.
    pub fn add_signal<F>(&self, signum: i32, callback: F) -> Result<()>
    where
        F: FnMut(i32) + Send + 'static,
    {
        let event = SignalEvent::new(signum, Box::new(callback))?;
        self.submit(Change::Add(Box::new(event), Interest::READABLE))
    }

    /// Runs `callback` on the I/O thread, right away or after `interval` when
    /// `delay` is set, then every `interval` while it returns `true`.
    ///
    /// `repeats` caps the total number of runs; `None` leaves it unbounded.
    /// Callbacks share the I/O thread with every connection and must be short.
    pub fn add_timer<F>(
        &self,
        interval: Duration,
        delay: bool,
        repeats: Option<u32>,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.submit(Change::Timer {
            callback: Box::new(callback),
            interval,
            delay,
            repeats,
        })
    }

    fn submit(&self, change: Change) -> Result<()> {
        self.commands.send(change).map_err(|_| Error::ReactorGone)?;
        self.wakeup();
        Ok(())
    }
}

/// Single-threaded readiness loop.
///
/// Owns the multiplexer and every registered event object. All registration
/// changes and all event callbacks happen on the thread calling [`run`](Self::run).
pub struct Reactor {
    mux: Multiplexer,
    table: EventTable,
    changes: Changes,
    timers: TimerQueue,
    poll_timeout: Duration,
    commands: Receiver<Change>,
    handle: ReactorHandle,
}

impl Reactor {
    pub fn new(config: &ReactorConfig) -> Result<Self> {
        let mux = Multiplexer::new(config.events_capacity)?;
        let waker = Waker::new(mux.registry(), WAKE_TOKEN).map_err(Error::ResourceInit)?;
        let (sender, commands) = mpsc::channel();

        Ok(Reactor {
            mux,
            table: EventTable::default(),
            changes: Changes::default(),
            timers: TimerQueue::default(),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            commands,
            handle: ReactorHandle {
                commands: sender,
                waker: Arc::new(waker),
                shutdown: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Takes ownership of `event` (unless its handle is already owned) and
    /// registers it with `interest`.
    ///
    /// A handle that is already in the table is re-armed in place and the
    /// incoming object is dropped. `Interest::TIMER` schedules a one-shot
    /// timer notification after the poll timeout.
    pub fn add_event(&mut self, event: Box<dyn EventHandler>, interest: Interest) -> Result<()> {
        if interest.is_empty() {
            return Err(Error::InvalidArgument("interest mask is empty"));
        }

        let handle = event.handle();
        let (owned, fresh) = match self.table.0.entry(handle) {
            Entry::Vacant(slot) => (slot.insert(event), true),
            Entry::Occupied(slot) => {
                debug!(handle, "handle already owned, re-arming existing event");
                (slot.into_mut(), false)
            }
        };

        let io = interest - Interest::TIMER;
        let result = if io.is_empty() {
            Ok(())
        } else {
            self.mux.register(owned.as_mut(), io)
        };

        match result {
            Ok(()) => {
                if interest.contains(Interest::TIMER) {
                    let generation = owned.generation();
                    self.timers.schedule(
                        Instant::now() + self.poll_timeout,
                        TimerTarget::Event { handle, generation },
                    );
                }
                Ok(())
            }
            Err(err) => {
                if fresh {
                    self.table.0.remove(&handle);
                }
                Err(err)
            }
        }
    }

    /// Re-arms the event owning `handle` with a new interest mask.
    pub fn rearm(&mut self, handle: Handle, interest: Interest) -> Result<()> {
        let event = self
            .table
            .0
            .get_mut(&handle)
            .ok_or(Error::InvalidArgument("handle is not registered"))?;
        self.mux.register(event.as_mut(), interest)
    }

    /// Unregisters and destroys the event owning `handle`. Returns whether
    /// anything was removed.
    pub fn remove_event(&mut self, handle: Handle) -> bool {
        let Some(mut event) = self.table.0.remove(&handle) else {
            return false;
        };
        self.mux.unregister(event.as_mut());
        self.mux.forget_listener(handle);
        trace!(handle, "destroyed event");
        true
    }

    /// Whether `target` still names a live registration.
    fn owns(&self, target: Target) -> bool {
        self.table.0.get(&target.handle).is_some_and(|event| {
            target
                .generation
                .map_or(true, |generation| event.generation() == generation)
        })
    }

    pub fn lookup(&self, handle: Handle) -> Option<&dyn EventHandler> {
        self.table.0.get(&handle).map(|event| event.as_ref() as &dyn EventHandler)
    }

    pub fn len(&self) -> usize {
        self.table.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.0.is_empty()
    }

    /// Polls and dispatches until [`ReactorHandle::stop`] is called or the
    /// multiplexer fails.
    pub fn run(&mut self) -> Result<()> {
        info!(events = self.len(), "reactor started");
        while !self.handle.is_stopped() {
            self.turn()?;
        }
        info!(pending_timers = self.timers.len(), "reactor stopped");
        Ok(())
    }

    /// One loop iteration: apply queued commands, poll once, apply the
    /// changes handlers made, then fire expired timers.
    pub fn turn(&mut self) -> Result<usize> {
        while let Ok(change) = self.commands.try_recv() {
            self.apply(change);
        }

        let timeout = self
            .timers
            .poll_timeout(Instant::now(), Some(self.poll_timeout));
        let delivered = self.mux.poll(&mut self.table, &mut self.changes, timeout)?;
        self.apply_changes();

        self.fire_timers();
        self.apply_changes();
        Ok(delivered)
    }

    fn apply_changes(&mut self) {
        for change in self.changes.take() {
            self.apply(change);
        }
    }

    fn apply(&mut self, change: Change) {
        match change {
            Change::Add(event, interest) => {
                let handle = event.handle();
                if let Err(err) = self.add_event(event, interest) {
                    warn!(handle, error = %err, "failed to add event");
                }
            }
            Change::Rearm(target, interest) => {
                if !self.owns(target) {
                    debug!(
                        handle = target.handle,
                        generation = ?target.generation,
                        "dropping re-arm for a stale registration"
                    );
                    return;
                }
                if let Err(err) = self.rearm(target.handle, interest) {
                    debug!(handle = target.handle, error = %err, "failed to re-arm event");
                }
            }
            Change::Remove(target) => {
                if !self.owns(target) {
                    debug!(
                        handle = target.handle,
                        generation = ?target.generation,
                        "dropping removal for a stale registration"
                    );
                    return;
                }
                self.remove_event(target.handle);
            }
            Change::Schedule(target, after) => {
                let generation = match self.table.0.get(&target.handle) {
                    Some(event) if self.owns(target) => event.generation(),
                    _ => {
                        trace!(handle = target.handle, "not scheduling a timer for a stale registration");
                        return;
                    }
                };
                self.timers.schedule(
                    Instant::now() + after,
                    TimerTarget::Event {
                        handle: target.handle,
                        generation,
                    },
                );
            }
            Change::Timer {
                callback,
                interval,
                delay,
                repeats,
            } => {
                let now = Instant::now();
                let deadline = if delay { now + interval } else { now };
                self.timers.schedule(
                    deadline,
                    TimerTarget::Callback {
                        callback,
                        interval,
                        remaining: repeats,
                    },
                );
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for target in self.timers.expired(now) {
            match target {
                TimerTarget::Event { handle, generation } => match self.table.0.get_mut(&handle) {
                    Some(event)
                        if event.generation() == generation && !self.changes.is_removed(handle) =>
                    {
                        event.handle_event(EventKind::Timer, &mut self.changes);
                    }
                    _ => trace!(handle, "timer expired for a removed event"),
                },
                TimerTarget::Callback {
                    mut callback,
                    interval,
                    remaining,
                } => {
                    let again = callback();
                    let remaining = remaining.map(|left| left.saturating_sub(1));
                    if again && remaining != Some(0) {
                        self.timers.schedule(
                            now + interval,
                            TimerTarget::Callback {
                                callback,
                                interval,
                                remaining,
                            },
                        );
                    }
                }
            }
        }
    }
}
