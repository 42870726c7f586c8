//! Interpolation.
//!
//! The server sends discrete position updates for other players. The client
//! renders at its own rate and eases each remote entity toward its latest
//! target every frame instead of snapping.
//!
//! Ordering: updates carrying a sequence must be newer than the last applied
//! one. Joins carry no sequence; they only win if no sequenced update landed
//! within the guard window, so a late join cannot drag an entity back.
//!
//! Departed ids are remembered (up to `MAX_DEPARTED`) and any move still in
//! flight for them is dropped, so a leave is final until an explicit join.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use dungeon_shared::{
    command::Sequence,
    math::Vec2,
    net::{EntityId, RemoteUpdate},
};
use tokio::time::Instant;
use tracing::debug;

/// Distance below which `current` snaps onto `target`.
pub const SNAP_EPSILON: f32 = 0.01;

const MIN_FACTOR: f32 = 0.01;

/// Departed ids remembered before the oldest is forgotten.
pub const MAX_DEPARTED: usize = 256;

/// Interpolated state of one remote entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntitySnapshot {
    pub id: EntityId,
    pub current: Vec2,
    pub target: Vec2,
    last_sequence: Option<Sequence>,
    last_sequenced_at: Option<Instant>,
}

impl RemoteEntitySnapshot {
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.last_sequence
    }
}

/// What happened to an incoming update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Created,
    Applied,
    /// Older than what was already applied; ignored.
    Stale,
}

/// Remote entity table.
#[derive(Debug, Clone)]
pub struct RemoteInterpolator {
    entities: BTreeMap<EntityId, RemoteEntitySnapshot>,
    /// Departed ids with the last sequence applied before the leave.
    departed: BTreeMap<EntityId, Option<Sequence>>,
    departed_order: VecDeque<EntityId>,
    factor: f32,
    unsequenced_guard: Duration,
}

impl RemoteInterpolator {
    pub fn new(factor: f32, unsequenced_guard: Duration) -> Self {
        Self {
            entities: BTreeMap::new(),
            departed: BTreeMap::new(),
            departed_order: VecDeque::new(),
            factor: factor.clamp(MIN_FACTOR, 1.0),
            unsequenced_guard,
        }
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }

    /// Applies a network update, creating the entity on first sight.
    pub fn on_update(&mut self, update: &RemoteUpdate, now: Instant) -> UpdateOutcome {
        if let Some(last) = self.departed.get(&update.id) {
            debug!(entity = %update.id, seq = ?update.sequence, last = ?last, "Update for departed entity");
            return UpdateOutcome::Stale;
        }
        let Some(snap) = self.entities.get_mut(&update.id) else {
            self.entities.insert(
                update.id.clone(),
                RemoteEntitySnapshot {
                    id: update.id.clone(),
                    current: update.position,
                    target: update.position,
                    last_sequence: update.sequence,
                    last_sequenced_at: update.sequence.map(|_| now),
                },
            );
            debug!(entity = %update.id, "Remote entity created");
            return UpdateOutcome::Created;
        };

        match update.sequence {
            Some(seq) => {
                if snap.last_sequence.is_some_and(|last| seq <= last) {
                    debug!(entity = %update.id, seq, last = ?snap.last_sequence, "Stale remote update");
                    return UpdateOutcome::Stale;
                }
                snap.last_sequence = Some(seq);
                snap.last_sequenced_at = Some(now);
            }
            None => {
                let guarded = snap
                    .last_sequenced_at
                    .is_some_and(|t| now.saturating_duration_since(t) < self.unsequenced_guard);
                if guarded {
                    debug!(entity = %update.id, "Unsequenced update inside guard window");
                    return UpdateOutcome::Stale;
                }
            }
        }
        snap.target = update.position;
        UpdateOutcome::Applied
    }

    /// Convenience for join notifications, which carry no sequence. A join
    /// is the only thing that brings a departed id back.
    pub fn on_join(&mut self, id: EntityId, position: Vec2, now: Instant) -> UpdateOutcome {
        if self.departed.remove(&id).is_some() {
            self.departed_order.retain(|d| d != &id);
        }
        self.on_update(
            &RemoteUpdate {
                id,
                position,
                sequence: None,
            },
            now,
        )
    }

    /// Forgets an entity and ignores its later moves. Returns false if it
    /// was unknown.
    pub fn remove(&mut self, id: &EntityId) -> bool {
        let removed = self.entities.remove(id);
        if removed.is_some() {
            debug!(entity = %id, "Remote entity removed");
        }
        let last = removed.as_ref().and_then(RemoteEntitySnapshot::last_sequence);
        if self.departed.insert(id.clone(), last).is_none() {
            self.departed_order.push_back(id.clone());
        }
        while self.departed_order.len() > MAX_DEPARTED {
            if let Some(oldest) = self.departed_order.pop_front() {
                self.departed.remove(&oldest);
            }
        }
        removed.is_some()
    }

    /// Advances every entity one frame toward its target.
    pub fn step(&mut self) {
        for snap in self.entities.values_mut() {
            let next = snap.current.lerp(snap.target, self.factor);
            snap.current = if next.distance(snap.target) < SNAP_EPSILON {
                snap.target
            } else {
                next
            };
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<&RemoteEntitySnapshot> {
        self.entities.get(id)
    }

    /// Entities in id order.
    pub fn iter(&self) -> impl Iterator<Item = &RemoteEntitySnapshot> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.departed.clear();
        self.departed_order.clear();
    }
}
