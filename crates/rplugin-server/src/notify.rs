//! Fixed-capacity parameter-change notification ring. The hosted plugin can
//! generate automation events faster than the host drains them (automation
//! playback, a twiddled knob mid-gesture); rather than block the audio
//! thread or grow without bound, the oldest pending entry is dropped.

use std::collections::VecDeque;

use rplugin_core::PARAM_NOTIFY_CAPACITY;
use rplugin_plugin::PluginEvent;
use tracing::debug;

/// Drop-oldest ring of plugin-originated events awaiting delivery to the
/// host's UI side channel.
#[derive(Default)]
pub struct NotifyRing {
    pending: VecDeque<PluginEvent>,
    dropped: u64,
}

impl NotifyRing {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: VecDeque::with_capacity(PARAM_NOTIFY_CAPACITY),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: PluginEvent) {
        if self.pending.len() == PARAM_NOTIFY_CAPACITY {
            self.pending.pop_front();
            self.dropped += 1;
            debug!(total_dropped = self.dropped, "parameter notify ring overflowed");
        }
        self.pending.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PluginEvent> {
        self.pending.drain(..).collect()
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_beyond_capacity_drops_oldest() {
        let mut ring = NotifyRing::new();
        for i in 0..PARAM_NOTIFY_CAPACITY + 5 {
            ring.push(PluginEvent::ParameterChanged {
                index: i as i32,
                value: 0.0,
            });
        }
        assert_eq!(ring.dropped_count(), 5);
        let drained = ring.drain();
        assert_eq!(drained.len(), PARAM_NOTIFY_CAPACITY);
        match drained[0] {
            PluginEvent::ParameterChanged { index, .. } => assert_eq!(index, 5),
            _ => unreachable!(),
        }
    }

    #[test]
    fn drain_empties_the_ring() {
        let mut ring = NotifyRing::new();
        ring.push(PluginEvent::BeginEdit { index: 1 });
        assert_eq!(ring.drain().len(), 1);
        assert!(ring.drain().is_empty());
    }
}
