//! Terminal-flag placement for fan-out.
//!
//! Every stage turns one inbound message into zero or more outbound ones.
//! The protocol invariant: for every inbound `last_item` (resp.
//! `last_job_item`) a stage emits exactly one outbound message carrying it,
//! produced after all its other outbound messages. `FanOut` is the one place
//! that arithmetic lives; stages never hand-place flags.

use crate::message::{ControlFlags, RelayFlags};

/// Flag assignment across the children of a single fan-out.
///
/// `terminal_eligible` is false while some later sub-extraction (a next page,
/// a nested continuation) will run for this branch; the terminal flags are
/// then withheld here and relayed to whichever producer eventually runs last.
#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    incoming: ControlFlags,
    count: usize,
    terminal_eligible: bool,
}

impl FanOut {
    pub fn new(incoming: ControlFlags, count: usize) -> Self {
        Self {
            incoming,
            count,
            terminal_eligible: true,
        }
    }

    /// Withhold the terminal flags from this fan-out when `eligible` is
    /// false (more pages, pending nested sub-fan-out, relay bit not held).
    pub fn terminal_eligible(mut self, eligible: bool) -> Self {
        self.terminal_eligible = eligible;
        self
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Flags for the `index`-th of `count` children.
    pub fn child(&self, index: usize) -> ControlFlags {
        debug_assert!(index < self.count, "fan-out child index out of range");
        let is_first = index == 0;
        let is_last = index + 1 == self.count;
        let terminal = is_last && self.terminal_eligible;
        ControlFlags {
            first_item: self.incoming.first_item && is_first,
            last_item: self.incoming.last_item && terminal,
            last_job_item: self.incoming.last_job_item && terminal,
            rate_limited: self.incoming.rate_limited && terminal,
        }
    }

    /// A fan-out that produced no children still owes the step its terminal
    /// marker when this branch was the one eligible to carry it.
    pub fn completion_needed(&self) -> bool {
        self.count == 0
            && self.terminal_eligible
            && (self.incoming.last_item || self.incoming.last_job_item)
    }
}

/// Whether a nested continuation page terminates the job: it must hold the
/// last-nested-of-last-parent relay bit and have exhausted its own pages.
pub fn nested_page_terminates(relay: RelayFlags, has_next_page: bool) -> bool {
    relay.last_parent_last_nested && !has_next_page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_child_collapses_all_flags() {
        let fan_out = FanOut::new(ControlFlags::seed(), 1);
        let flags = fan_out.child(0);
        assert!(flags.first_item);
        assert!(flags.last_item);
        assert!(flags.last_job_item);
    }

    #[test]
    fn many_children_place_flags_at_the_ends() {
        let fan_out = FanOut::new(ControlFlags::seed(), 5);
        for index in 0..5 {
            let flags = fan_out.child(index);
            assert_eq!(flags.first_item, index == 0);
            assert_eq!(flags.last_item, index == 4);
            assert_eq!(flags.last_job_item, index == 4);
        }
    }

    #[test]
    fn withheld_terminal_never_marks_a_child() {
        let fan_out = FanOut::new(ControlFlags::seed(), 3).terminal_eligible(false);
        for index in 0..3 {
            let flags = fan_out.child(index);
            assert!(!flags.last_item);
            assert!(!flags.last_job_item);
        }
        // First-item placement is unaffected by eligibility.
        assert!(fan_out.child(0).first_item);
    }

    #[test]
    fn non_terminal_incoming_produces_no_terminal_children() {
        let incoming = ControlFlags {
            first_item: false,
            last_item: false,
            last_job_item: false,
            rate_limited: false,
        };
        let fan_out = FanOut::new(incoming, 4);
        for index in 0..4 {
            let flags = fan_out.child(index);
            assert_eq!(flags, ControlFlags::default());
        }
        assert!(!fan_out.completion_needed());
    }

    #[test]
    fn zero_children_require_completion_only_when_eligible() {
        let terminal = FanOut::new(ControlFlags::seed(), 0);
        assert!(terminal.completion_needed());

        let deferred = FanOut::new(ControlFlags::seed(), 0).terminal_eligible(false);
        assert!(!deferred.completion_needed());

        let mid_stream = FanOut::new(ControlFlags::default(), 0);
        assert!(!mid_stream.completion_needed());
    }

    #[test]
    fn rate_limited_rides_the_terminal_child() {
        let fan_out = FanOut::new(ControlFlags::completion(true), 2);
        assert!(!fan_out.child(0).rate_limited);
        assert!(fan_out.child(1).rate_limited);
        assert!(fan_out.child(1).last_job_item);
    }

    #[test]
    fn nested_termination_needs_relay_bit_and_exhaustion() {
        let relay = RelayFlags {
            last_parent: true,
            last_parent_last_nested: true,
        };
        assert!(nested_page_terminates(relay, false));
        assert!(!nested_page_terminates(relay, true));
        assert!(!nested_page_terminates(RelayFlags::default(), false));
    }
}
