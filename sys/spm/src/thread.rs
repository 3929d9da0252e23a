// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads, the scheduler, and wait events.
//!
//! Every partition gets one thread slot, at the same index as the partition
//! itself. Scheduling is strictly by static priority: the thread that runs is
//! the first RUNNING thread in priority order. Threads are inserted into the
//! order once, when started, and never leave it; exited threads simply stop
//! being RUNNING.
//!
//! The scheduler never switches on its own. Anything that changes which
//! thread ought to run calls [`Scheduler::activate_schedule`], which leaves a
//! note and pends the architecture's deferred switch. The switch itself
//! happens in `SpmState::pendsv`.

use abi::{FaultInfo, MemRange, UsageError};
use heapless::Vec;

use crate::arch::{self, SavedState};
use crate::MAX_PARTITIONS;

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to thread state for the rest of
/// the SPM.
///
/// Architectures need to implement the `argX` and `ret0` functions plus
/// `syscall_descriptor`.
pub trait ArchState: Default {
    fn stack_pointer(&self) -> usize;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> usize;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> usize;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> usize;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> usize;

    /// Reads the syscall descriptor (number).
    fn syscall_descriptor(&self) -> u32;

    /// Writes syscall return argument 0.
    fn ret0(&mut self, _: usize);

    #[inline(always)]
    fn args(&self) -> [usize; 4] {
        [self.arg0(), self.arg1(), self.arg2(), self.arg3()]
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Set up but not yet started.
    Creating,
    /// Eligible to run.
    Running,
    /// Waiting on an event.
    Block,
    /// Exited; never runs again.
    Detach,
    /// Failed its start-up checks.
    Invalid,
}

#[derive(Clone, Debug)]
pub struct Thread {
    save: SavedState,
    stack: MemRange,
    entry: usize,
    priority: u8,
    state: ThreadState,
}

impl Thread {
    pub fn new(priority: u8, entry: usize, stack: MemRange) -> Self {
        Self {
            save: SavedState::default(),
            stack,
            entry,
            priority,
            state: ThreadState::Creating,
        }
    }

    pub fn save(&self) -> &SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut SavedState {
        &mut self.save
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn stack(&self) -> &MemRange {
        &self.stack
    }

    pub fn entry(&self) -> usize {
        self.entry
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    /// Thread arena. Index equals partition index.
    threads: Vec<Thread, MAX_PARTITIONS>,
    /// Arena indices of started threads, ascending by priority. Threads of
    /// equal priority are kept most-recently-started first.
    order: Vec<u8, MAX_PARTITIONS>,
    /// Position in `order` from which to start looking for a runnable
    /// thread. Every RUNNING thread sits at or after this position.
    runnable_head: Option<usize>,
    current: Option<usize>,
    pending: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a thread to the arena, returning its index.
    pub fn add(&mut self, thread: Thread) -> Result<usize, FaultInfo> {
        let idx = self.threads.len();
        self.threads.push(thread).map_err(|_| FaultInfo::Integrity)?;
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn thread(&self, idx: usize) -> &Thread {
        &self.threads[idx]
    }

    pub fn thread_mut(&mut self, idx: usize) -> &mut Thread {
        &mut self.threads[idx]
    }

    /// Starts a thread created by `add`: checks it over, inserts it into the
    /// priority order and makes it RUNNING.
    ///
    /// A thread that fails its checks is marked INVALID and never runs.
    pub fn start(&mut self, idx: usize) -> Result<(), FaultInfo> {
        let t = self.threads.get_mut(idx).ok_or(FaultInfo::Integrity)?;
        if t.state != ThreadState::Creating {
            return Err(UsageError::BadThread.into());
        }
        if t.entry == 0 || t.stack.is_empty() {
            t.state = ThreadState::Invalid;
            return Err(UsageError::BadThread.into());
        }
        let prio = t.priority;

        let pos = self
            .order
            .iter()
            .position(|&o| self.threads[usize::from(o)].priority >= prio)
            .unwrap_or(self.order.len());
        // Indices always fit; the arena is no bigger than u8::MAX.
        self.order
            .insert(pos, idx as u8)
            .map_err(|_| FaultInfo::Integrity)?;
        // Anything cached at or after the insertion point has moved along.
        if let Some(h) = self.runnable_head {
            if h >= pos {
                self.runnable_head = Some(h + 1);
            }
        }

        self.set_state(idx, ThreadState::Running);
        Ok(())
    }

    /// Changes a thread's state, keeping the runnable head accurate.
    pub fn set_state(&mut self, idx: usize, state: ThreadState) {
        self.threads[idx].state = state;
        let Some(pos) = self.position_of(idx) else {
            return;
        };
        let becomes_head = state == ThreadState::Running
            && self.runnable_head.map_or(true, |h| pos < h);
        if becomes_head {
            self.runnable_head = Some(pos);
        } else if state != ThreadState::Running {
            // Don't bother working out whether this thread was the head;
            // rescan from the top next time.
            self.runnable_head = if self.order.is_empty() { None } else { Some(0) };
        }
    }

    /// Marks a thread as finished and asks for a switch away from it.
    pub fn exit(&mut self, idx: usize) {
        self.set_state(idx, ThreadState::Detach);
        self.activate_schedule();
    }

    /// Picks the thread that should run now: the most important RUNNING
    /// thread.
    pub fn next_thread(&self) -> Option<usize> {
        let start = self.runnable_head?;
        self.order[start..]
            .iter()
            .map(|&o| usize::from(o))
            .find(|&i| self.threads[i].state == ThreadState::Running)
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn set_current(&mut self, idx: usize) {
        self.current = Some(idx);
    }

    /// Requests a deferred context switch. Requests made before the switch
    /// happens collapse into one.
    pub fn activate_schedule(&mut self) {
        if !self.pending {
            self.pending = true;
            arch::pend_context_switch();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Consumes the pending switch request, if any.
    pub fn take_pending(&mut self) -> bool {
        core::mem::take(&mut self.pending)
    }

    /// Stores a return value into a thread's saved registers.
    pub fn set_retval(&mut self, idx: usize, value: usize) {
        self.threads[idx].save.ret0(value);
    }

    fn position_of(&self, idx: usize) -> Option<usize> {
        self.order.iter().position(|&o| usize::from(o) == idx)
    }
}

/// A one-shot wait point with at most one waiting thread.
///
/// Partitions use one of these to wait for signals; each in-flight message
/// uses one to hold its client until the reply.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Event {
    owner: Option<usize>,
}

impl Event {
    /// Blocks `thread` on this event and requests a switch away from it.
    pub fn wait(&mut self, sched: &mut Scheduler, thread: usize) {
        self.owner = Some(thread);
        sched.set_state(thread, ThreadState::Block);
        sched.activate_schedule();
    }

    /// Wakes the waiting thread, if it's still blocked, handing it `retval`
    /// as the result of the call that blocked it. Returns whether anyone
    /// was woken.
    pub fn wake(&mut self, sched: &mut Scheduler, retval: usize) -> bool {
        match self.owner {
            Some(t) if sched.thread(t).state() == ThreadState::Block => {
                sched.set_state(t, ThreadState::Running);
                sched.set_retval(t, retval);
                self.owner = None;
                sched.activate_schedule();
                true
            }
            _ => false,
        }
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }
}

static_assertions::const_assert!(MAX_PARTITIONS <= u8::MAX as usize);

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(n: usize) -> MemRange {
        MemRange::new(0x3000_0000 + n * 0x1000, 0x3000_1000 + n * 0x1000)
    }

    fn sched_with(prios: &[u8]) -> Scheduler {
        let mut s = Scheduler::new();
        for (i, &p) in prios.iter().enumerate() {
            s.add(Thread::new(p, 0x1000_0001, stack(i))).unwrap();
        }
        s
    }

    #[test]
    fn picks_most_important_running() {
        let mut s = sched_with(&[5, 1, 3]);
        for i in 0..3 {
            s.start(i).unwrap();
        }
        assert_eq!(s.next_thread(), Some(1));
        s.set_state(1, ThreadState::Block);
        assert_eq!(s.next_thread(), Some(2));
        s.set_state(2, ThreadState::Detach);
        assert_eq!(s.next_thread(), Some(0));
        s.set_state(1, ThreadState::Running);
        assert_eq!(s.next_thread(), Some(1));
    }

    #[test]
    fn equal_priorities_prefer_latest_start() {
        let mut s = sched_with(&[2, 2]);
        s.start(0).unwrap();
        s.start(1).unwrap();
        assert_eq!(s.next_thread(), Some(1));
        s.set_state(1, ThreadState::Block);
        assert_eq!(s.next_thread(), Some(0));
        // Waking the earlier-ordered thread must not be hidden behind the
        // cached head.
        s.set_state(1, ThreadState::Running);
        assert_eq!(s.next_thread(), Some(1));
    }

    #[test]
    fn start_rejects_bad_threads() {
        let mut s = Scheduler::new();
        let a = s.add(Thread::new(0, 0, stack(0))).unwrap();
        let b = s.add(Thread::new(0, 0x1000_0001, MemRange::EMPTY)).unwrap();
        let c = s.add(Thread::new(0, 0x1000_0001, stack(2))).unwrap();
        assert!(s.start(a).is_err());
        assert_eq!(s.thread(a).state(), ThreadState::Invalid);
        assert!(s.start(b).is_err());
        s.start(c).unwrap();
        assert_eq!(
            s.start(c),
            Err(FaultInfo::SyscallUsage(UsageError::BadThread))
        );
        assert_eq!(s.next_thread(), Some(c));
    }

    #[test]
    fn schedule_requests_coalesce() {
        let mut s = sched_with(&[0]);
        assert!(!s.take_pending());
        s.activate_schedule();
        s.activate_schedule();
        assert!(s.take_pending());
        assert!(!s.take_pending());
    }

    #[test]
    fn event_round_trip() {
        let mut s = sched_with(&[1, 2]);
        s.start(0).unwrap();
        s.start(1).unwrap();
        let mut ev = Event::default();
        ev.wait(&mut s, 0);
        assert_eq!(s.thread(0).state(), ThreadState::Block);
        assert_eq!(s.next_thread(), Some(1));
        assert!(s.take_pending());

        assert!(ev.wake(&mut s, 0x42));
        assert_eq!(s.thread(0).state(), ThreadState::Running);
        assert_eq!(s.next_thread(), Some(0));
        assert_eq!(ev.owner(), None);
        // A second wake has nobody to wake.
        assert!(!ev.wake(&mut s, 0x43));
    }

    #[test]
    fn wake_ignores_threads_no_longer_blocked() {
        let mut s = sched_with(&[1]);
        s.start(0).unwrap();
        let mut ev = Event::default();
        ev.wait(&mut s, 0);
        s.set_state(0, ThreadState::Detach);
        assert!(!ev.wake(&mut s, 1));
        assert_eq!(s.thread(0).state(), ThreadState::Detach);
    }
}
