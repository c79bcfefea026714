//! Drag interaction lock
//!
//! Pointer drag libraries fire a trailing click when the pointer is
//! released. The tracker swallows clicks on the dragged widget until the
//! cooldown has elapsed since the *last* drag event, so continued small
//! movements keep extending the lock.
//!
//! ```text
//! Idle --begin--> Dragging --end--> CooldownLocked --(cooldown elapsed)--> Idle
//!                    ^                    |
//!                    +------begin---------+
//! ```

use std::time::Duration;

use tokio::time::Instant;

use crate::model::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum DragPhase {
    Idle,
    Dragging {
        instance_id: String,
        origin: Position,
        last_event: Instant,
    },
    CooldownLocked {
        instance_id: String,
        last_event: Instant,
    },
}

#[derive(Debug)]
pub struct DragTracker {
    phase: DragPhase,
    cooldown: Duration,
}

impl DragTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            phase: DragPhase::Idle,
            cooldown,
        }
    }

    /// Current phase, expiring an elapsed cooldown first
    pub fn phase(&mut self, now: Instant) -> &DragPhase {
        if let DragPhase::CooldownLocked { last_event, .. } = &self.phase
            && now.duration_since(*last_event) >= self.cooldown
        {
            self.phase = DragPhase::Idle;
        }
        &self.phase
    }

    /// Starts dragging `instance_id` from `origin`. A drag already in
    /// progress on another widget is abandoned.
    pub fn begin(&mut self, instance_id: &str, origin: Position, now: Instant) {
        self.phase = DragPhase::Dragging {
            instance_id: instance_id.to_string(),
            origin,
            last_event: now,
        };
    }

    /// Absolute position for a drag frame with cumulative offset `(dx, dy)`
    pub fn drag_to(&mut self, instance_id: &str, dx: f64, dy: f64, now: Instant) -> Option<Position> {
        match &mut self.phase {
            DragPhase::Dragging {
                instance_id: dragged,
                origin,
                last_event,
            } if dragged.as_str() == instance_id => {
                *last_event = now;
                Some(origin.offset(dx, dy))
            }
            _ => None,
        }
    }

    /// Final absolute position; enters the cooldown lock
    pub fn end(&mut self, instance_id: &str, dx: f64, dy: f64, now: Instant) -> Option<Position> {
        let position = self.drag_to(instance_id, dx, dy, now)?;
        self.phase = DragPhase::CooldownLocked {
            instance_id: instance_id.to_string(),
            last_event: now,
        };
        Some(position)
    }

    /// Whether a click on `instance_id` should open its configuration
    pub fn click_allowed(&mut self, instance_id: &str, now: Instant) -> bool {
        match self.phase(now) {
            DragPhase::Idle => true,
            DragPhase::Dragging { instance_id: id, .. } | DragPhase::CooldownLocked { instance_id: id, .. } => {
                id != instance_id
            }
        }
    }

    /// Hover affordances are suppressed while any drag is in progress
    pub fn hover_enabled(&mut self, now: Instant) -> bool {
        !matches!(self.phase(now), DragPhase::Dragging { .. })
    }

    /// Forgets a widget that left the scene
    pub fn forget(&mut self, instance_id: &str) {
        let tracked = match &self.phase {
            DragPhase::Idle => false,
            DragPhase::Dragging { instance_id: id, .. } | DragPhase::CooldownLocked { instance_id: id, .. } => {
                id == instance_id
            }
        };
        if tracked {
            self.phase = DragPhase::Idle;
        }
    }
}
