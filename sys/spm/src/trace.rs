// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event trace for debugging the SPM.
//!
//! The SPM has nowhere to print to, so instead it records what it did in a
//! small ring buffer that a debugger can find and decode. Each entry carries
//! the source line that recorded it. Recording the same payload from the same
//! line twice in a row bumps a counter on the existing entry instead of
//! consuming a new one, so a partition spinning on `psa_wait` doesn't wipe
//! out the interesting history.
//!
//! Entries are added with [`ringbuf_entry!`]:
//!
//! ```ignore
//! ringbuf_entry!(self.trace, Trace::Notify { partition_id });
//! ```

use abi::FaultInfo;

/// Number of entries kept by the SPM's trace buffer.
pub const TRACE_DEPTH: usize = 64;

/// Things the SPM records about itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    Connect { sid: u32, client_id: i32 },
    Call { handle: i32, msg_type: i32 },
    Close { handle: i32 },
    Get { signal: u32, handle: i32 },
    Reply { handle: i32, status: i32 },
    Notify { partition_id: i32 },
    Irq { line: u32 },
    Switch { to: usize },
    MailboxSlot { slot: usize, call_type: i32 },
    MailboxReply { slot: usize, value: i32 },
    SfnRequest { from: usize, to: usize },
    SfnReturn { from: usize, to: usize },
    Depriv { line: u32, to: usize },
    Fault(FaultInfo),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    /// Creates an empty ring buffer, with every slot holding `init`.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // None is treated as an out-of-range index, which both skips the
        // reuse check and makes the first entry land in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Deliberately not a remainder: usize::MAX must wrap to 0 here.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// The most recently recorded entry, if any.
    pub fn last(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Iterates over recorded entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = self.last.map_or(0, |l| l + 1);
        self.buffer[start..]
            .iter()
            .chain(self.buffer[..start].iter())
            .filter(|e| e.count != 0)
    }
}

/// Records `$payload` in `$buf`, tagged with the current source line.
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {
        $buf.entry(line!() as u16, $payload)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_counted() {
        let mut rb = Ringbuf::<Trace, 4>::new(Trace::None);
        rb.entry(10, Trace::Irq { line: 3 });
        rb.entry(10, Trace::Irq { line: 3 });
        rb.entry(10, Trace::Irq { line: 4 });
        let all: Vec<_> = rb.iter().map(|e| (e.payload, e.count)).collect();
        assert_eq!(
            all,
            vec![(Trace::Irq { line: 3 }, 2), (Trace::Irq { line: 4 }, 1)]
        );
    }

    #[test]
    fn wraps_and_keeps_order() {
        let mut rb = Ringbuf::<u32, 3>::new(0);
        for i in 1..=5 {
            rb.entry(i as u16, i);
        }
        let all: Vec<_> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(all, vec![3, 4, 5]);
        assert_eq!(rb.last().map(|e| e.payload), Some(5));
        // Slot 0 has been used twice.
        assert_eq!(rb.buffer[0].generation, 2);
    }
}
