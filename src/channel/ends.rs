//! Which interpreters hold which end of a channel.
//!
//! Every interpreter that ever sends or receives gets an entry on the
//! corresponding side. Entries are only ever flipped to closed, never
//! removed, so historical membership stays queryable and the open counters
//! are the single source of truth for "is anything still attached".

use crate::interp::InterpId;

bitflags::bitflags! {
    /// Selects the end(s) an operation applies to.
    ///
    /// An empty selection means *both* ends; callers rely on that
    /// reading.
    pub struct EndFlags: u8 {
        const SEND = 0b01;
        const RECV = 0b10;
    }
}

impl EndFlags {
    #[inline]
    pub(crate) fn wants_send(self) -> bool {
        self.is_empty() || self.contains(EndFlags::SEND)
    }

    #[inline]
    pub(crate) fn wants_recv(self) -> bool {
        self.is_empty() || self.contains(EndFlags::RECV)
    }
}

struct ChannelEnd {
    interpid: InterpId,
    open: bool,
}

#[derive(Default)]
pub(crate) struct ChannelEnds {
    send: Vec<ChannelEnd>,
    recv: Vec<ChannelEnd>,
    num_send_open: usize,
    num_recv_open: usize,
}

impl ChannelEnds {
    pub fn new() -> Self {
        Self::default()
    }

    fn side(&self, send: bool) -> &Vec<ChannelEnd> {
        if send {
            &self.send
        } else {
            &self.recv
        }
    }

    /// Bind `interpid` to one side. Fails (with `false`) if the
    /// interpreter previously released that end: a released end cannot be
    /// re-opened.
    pub fn associate(&mut self, interpid: InterpId, send: bool) -> bool {
        let list = if send { &mut self.send } else { &mut self.recv };
        if let Some(end) = list.iter().find(|e| e.interpid == interpid) {
            return end.open;
        }
        list.push(ChannelEnd {
            interpid,
            open: true,
        });
        if send {
            self.num_send_open += 1;
        } else {
            self.num_recv_open += 1;
        }
        true
    }

    /// Close `interpid`'s entries on the selected side(s). An interpreter
    /// that never bound gets a pre-closed entry, so a later `associate`
    /// still sees the end as released. Idempotent.
    pub fn release_interpreter(&mut self, interpid: InterpId, which: EndFlags) {
        if which.wants_send() {
            Self::release_one(&mut self.send, &mut self.num_send_open, interpid);
        }
        if which.wants_recv() {
            Self::release_one(&mut self.recv, &mut self.num_recv_open, interpid);
        }
    }

    fn release_one(list: &mut Vec<ChannelEnd>, num_open: &mut usize, interpid: InterpId) {
        match list.iter_mut().find(|e| e.interpid == interpid) {
            Some(end) => {
                if end.open {
                    end.open = false;
                    *num_open -= 1;
                }
            }
            None => list.push(ChannelEnd {
                interpid,
                open: false,
            }),
        }
    }

    /// Close every entry on both sides.
    pub fn release_all(&mut self) {
        for end in self.send.iter_mut().chain(self.recv.iter_mut()) {
            end.open = false;
        }
        self.num_send_open = 0;
        self.num_recv_open = 0;
    }

    /// The teardown sweep for a dying interpreter: same as releasing both
    /// ends, except an interpreter that never bound leaves no trace.
    pub fn clear_interpreter(&mut self, interpid: InterpId) {
        for (list, num_open) in [
            (&mut self.send, &mut self.num_send_open),
            (&mut self.recv, &mut self.num_recv_open),
        ] {
            if let Some(end) = list.iter_mut().find(|e| e.interpid == interpid) {
                if end.open {
                    end.open = false;
                    *num_open -= 1;
                }
            }
        }
    }

    /// A channel counts as open while any end is bound and open, or while
    /// nothing has ever bound to it (the freshly created case).
    pub fn is_open(&self) -> bool {
        if self.num_send_open > 0 || self.num_recv_open > 0 {
            return true;
        }
        self.send.is_empty() && self.recv.is_empty()
    }

    /// Interpreters currently holding the chosen end open.
    pub fn list(&self, send: bool) -> Vec<InterpId> {
        self.side(send)
            .iter()
            .filter(|e| e.open)
            .map(|e| e.interpid)
            .collect()
    }

    /// Is `interpid` bound, and is the end still open? `None` means it
    /// never bound to this side.
    pub fn association(&self, interpid: InterpId, send: bool) -> Option<bool> {
        self.side(send)
            .iter()
            .find(|e| e.interpid == interpid)
            .map(|e| e.open)
    }

    /// Both sides as `(interpid, open)` pairs, for the info report.
    pub fn snapshot(&self) -> (Vec<(InterpId, bool)>, Vec<(InterpId, bool)>) {
        let grab = |list: &Vec<ChannelEnd>| {
            list.iter().map(|e| (e.interpid, e.open)).collect::<Vec<_>>()
        };
        (grab(&self.send), grab(&self.recv))
    }

    #[cfg(test)]
    pub fn open_counts(&self) -> (usize, usize) {
        (self.num_send_open, self.num_recv_open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_counts_as_open() {
        let ends = ChannelEnds::new();
        assert!(ends.is_open());
        assert_eq!(ends.open_counts(), (0, 0));
    }

    #[test]
    fn associate_then_release_closes_the_channel() {
        let mut ends = ChannelEnds::new();
        assert!(ends.associate(1, true));
        assert!(ends.associate(2, false));
        assert!(ends.is_open());
        assert_eq!(ends.open_counts(), (1, 1));

        ends.release_interpreter(1, EndFlags::SEND);
        assert!(ends.is_open());
        ends.release_interpreter(2, EndFlags::RECV);
        // Every end that ever bound has been released.
        assert!(!ends.is_open());
    }

    #[test]
    fn released_end_cannot_rebind() {
        let mut ends = ChannelEnds::new();
        assert!(ends.associate(1, true));
        ends.release_interpreter(1, EndFlags::SEND);
        assert!(!ends.associate(1, true));
        // The other side is unaffected.
        assert!(ends.associate(1, false));
    }

    #[test]
    fn release_is_idempotent() {
        let mut ends = ChannelEnds::new();
        ends.associate(1, true);
        ends.release_interpreter(1, EndFlags::SEND);
        ends.release_interpreter(1, EndFlags::SEND);
        assert_eq!(ends.open_counts(), (0, 0));
    }

    #[test]
    fn empty_selector_means_both_ends() {
        let mut ends = ChannelEnds::new();
        ends.associate(1, true);
        ends.associate(1, false);
        ends.release_interpreter(1, EndFlags::empty());
        assert_eq!(ends.open_counts(), (0, 0));
        assert!(!ends.is_open());
    }

    #[test]
    fn releasing_an_unbound_interpreter_leaves_a_closed_entry() {
        let mut ends = ChannelEnds::new();
        ends.associate(1, true);
        ends.release_interpreter(2, EndFlags::SEND);
        assert!(!ends.associate(2, true));
        assert_eq!(ends.open_counts(), (1, 0));
    }

    #[test]
    fn entries_are_never_removed() {
        let mut ends = ChannelEnds::new();
        ends.associate(1, true);
        ends.associate(2, true);
        ends.release_interpreter(1, EndFlags::SEND);
        let (send, _) = ends.snapshot();
        assert_eq!(send.len(), 2);
        assert_eq!(ends.list(true), vec![2]);
    }
}
