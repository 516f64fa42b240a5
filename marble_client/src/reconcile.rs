//! Snapshot reconciliation.
//!
//! Turns authoritative entity lists into a stable registry keyed by
//! entity id and converges rendered state toward the latest targets once
//! per frame. One reconciler per entity kind; the same machinery tracks
//! players and marbles.
//!
//! The server's list is the complete truth for its kind: ids seen for
//! the first time are created with rendered state equal to the target
//! (no first-frame pop-in), ids seen before keep their rendered state
//! and only move their target, and ids missing from the list are
//! dropped. Presence in the list is the only liveness signal.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tracing::debug;

use marble_shared::config::InterpSpeeds;
use marble_shared::math::{wrap_angle, Vec3};
use marble_shared::net::{MarbleRecord, PlayerRecord};

/// Server-assigned identity, unique within an entity kind.
pub type EntityId = u64;

/// A wire record the reconciler can track.
pub trait Replicated {
    /// Identity, if the record carries a usable one. Records without one
    /// are skipped at ingestion.
    fn entity_id(&self) -> Option<EntityId>;
    /// Authoritative position.
    fn position(&self) -> Vec3;
    /// Authoritative orientation, for kinds that have one.
    fn yaw(&self) -> Option<f32> {
        None
    }
}

impl Replicated for PlayerRecord {
    fn entity_id(&self) -> Option<EntityId> {
        self.id
    }

    fn position(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    fn yaw(&self) -> Option<f32> {
        Some(self.yaw)
    }
}

impl Replicated for MarbleRecord {
    fn entity_id(&self) -> Option<EntityId> {
        self.id
    }

    fn position(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
}

/// One tracked entity: the latest authoritative record plus rendered
/// state converging toward it.
#[derive(Debug, Clone)]
pub struct TrackedEntity<R> {
    /// Latest authoritative record; semantic attributes (colors, owner)
    /// ride along verbatim for the presentation layer.
    pub record: R,
    pub target_pos: Vec3,
    pub target_yaw: f32,
    /// Rendered position; mutated only by [`Reconciler::advance`].
    pub current_pos: Vec3,
    /// Rendered orientation, kept in (−π, π].
    pub current_yaw: f32,
}

/// Ids whose liveness changed in one [`Reconciler::apply`] call.
///
/// The presentation layer creates resources for `spawned` and releases
/// them for `removed`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileSummary {
    pub spawned: Vec<EntityId>,
    pub removed: Vec<EntityId>,
}

/// Registry of tracked entities for one kind.
pub struct Reconciler<R> {
    entities: HashMap<EntityId, TrackedEntity<R>>,
    speeds: InterpSpeeds,
}

impl<R: Replicated> Reconciler<R> {
    pub fn new(speeds: InterpSpeeds) -> Self {
        Self {
            entities: HashMap::new(),
            speeds,
        }
    }

    /// Ingests a complete authoritative list for this kind.
    ///
    /// Existing entities only have their target overwritten; rendered
    /// state is untouched here. Ids absent from `records` are removed;
    /// there is no other eviction path.
    pub fn apply<I>(&mut self, records: I) -> ReconcileSummary
    where
        I: IntoIterator<Item = R>,
    {
        let mut summary = ReconcileSummary::default();
        let mut live = HashSet::new();

        for record in records {
            let Some(id) = record.entity_id() else {
                // Unidentifiable record; nothing to correlate it with.
                continue;
            };
            live.insert(id);

            let target_pos = record.position();
            let target_yaw = record.yaw().unwrap_or(0.0);
            match self.entities.entry(id) {
                Entry::Occupied(mut slot) => {
                    let entity = slot.get_mut();
                    entity.record = record;
                    entity.target_pos = target_pos;
                    entity.target_yaw = target_yaw;
                }
                Entry::Vacant(slot) => {
                    slot.insert(TrackedEntity {
                        record,
                        target_pos,
                        target_yaw,
                        current_pos: target_pos,
                        current_yaw: target_yaw,
                    });
                    summary.spawned.push(id);
                }
            }
        }

        self.entities.retain(|id, _| {
            let keep = live.contains(id);
            if !keep {
                summary.removed.push(*id);
            }
            keep
        });

        if !summary.spawned.is_empty() || !summary.removed.is_empty() {
            debug!(
                spawned = summary.spawned.len(),
                removed = summary.removed.len(),
                tracked = self.entities.len(),
                "entity list reconciled"
            );
        }
        summary
    }

    /// Advances rendered state toward targets by `dt` seconds.
    ///
    /// Per field: `current += (target − current) × min(1, rate × dt)`.
    /// The clamp means a step can reach but never pass the target. Yaw
    /// deltas are wrapped so rotation takes the shorter path.
    pub fn advance(&mut self, dt: f32) {
        let alpha_pos = (self.speeds.position * dt).clamp(0.0, 1.0);
        let alpha_yaw = (self.speeds.orientation * dt).clamp(0.0, 1.0);
        for entity in self.entities.values_mut() {
            entity.current_pos = entity.current_pos.lerp(entity.target_pos, alpha_pos);
            let delta = wrap_angle(entity.target_yaw - entity.current_yaw);
            entity.current_yaw = wrap_angle(entity.current_yaw + delta * alpha_yaw);
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&TrackedEntity<R>> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &TrackedEntity<R>)> {
        self.entities.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: u64, x: f32, z: f32, yaw: f32) -> PlayerRecord {
        PlayerRecord {
            id: Some(id),
            x,
            z,
            yaw,
            ..PlayerRecord::default()
        }
    }

    fn reconciler() -> Reconciler<PlayerRecord> {
        Reconciler::new(InterpSpeeds {
            position: 10.0,
            orientation: 15.0,
        })
    }

    #[test]
    fn first_appearance_spawns_at_target() {
        let mut rec = reconciler();
        let summary = rec.apply(vec![player(7, 1.0, 2.0, 0.3)]);
        assert_eq!(summary.spawned, vec![7]);
        assert!(summary.removed.is_empty());

        let e = rec.get(7).unwrap();
        assert_eq!(e.current_pos, e.target_pos);
        assert_eq!(e.current_pos, Vec3::new(1.0, 0.0, 2.0));
        assert_eq!(e.current_yaw, 0.3);
    }

    #[test]
    fn update_overwrites_target_but_not_current() {
        let mut rec = reconciler();
        rec.apply(vec![player(7, 1.0, 2.0, 0.0)]);
        rec.apply(vec![player(7, 5.0, 2.0, 1.0)]);

        let e = rec.get(7).unwrap();
        assert_eq!(e.target_pos, Vec3::new(5.0, 0.0, 2.0));
        assert_eq!(e.target_yaw, 1.0);
        // Rendered state moves only through advance().
        assert_eq!(e.current_pos, Vec3::new(1.0, 0.0, 2.0));
        assert_eq!(e.current_yaw, 0.0);
    }

    #[test]
    fn apply_is_idempotent() {
        let mut rec = reconciler();
        let list = vec![player(1, 0.0, 0.0, 0.0), player(2, 1.0, 1.0, 0.0)];
        let first = rec.apply(list.clone());
        assert_eq!(first.spawned.len(), 2);

        let second = rec.apply(list);
        assert!(second.spawned.is_empty());
        assert!(second.removed.is_empty());
        assert_eq!(rec.len(), 2);
    }

    #[test]
    fn absence_is_the_only_removal_path() {
        let mut rec = reconciler();
        rec.apply(vec![player(1, 0.0, 0.0, 0.0), player(2, 1.0, 1.0, 0.0)]);

        let summary = rec.apply(vec![player(2, 1.0, 1.0, 0.0)]);
        assert_eq!(summary.removed, vec![1]);
        assert!(!rec.contains(1));
        assert!(rec.contains(2));

        // Entities never age out on their own.
        for _ in 0..100 {
            rec.advance(0.1);
        }
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn records_without_id_are_skipped() {
        let mut rec = reconciler();
        let summary = rec.apply(vec![PlayerRecord {
            x: 3.0,
            ..PlayerRecord::default()
        }]);
        assert!(summary.spawned.is_empty());
        assert!(rec.is_empty());
    }

    #[test]
    fn convergence_is_monotone_without_overshoot() {
        let mut rec = reconciler();
        rec.apply(vec![player(1, 0.0, 0.0, 0.0)]);
        rec.apply(vec![player(1, 4.0, -2.0, 0.0)]);

        let mut prev = {
            let e = rec.get(1).unwrap();
            let d = Vec3::new(
                e.target_pos.x - e.current_pos.x,
                e.target_pos.y - e.current_pos.y,
                e.target_pos.z - e.current_pos.z,
            );
            d.len_sq()
        };
        for _ in 0..40 {
            rec.advance(0.016);
            let e = rec.get(1).unwrap();
            // Never past the target in any axis.
            assert!(e.current_pos.x <= e.target_pos.x + 1e-6);
            assert!(e.current_pos.z >= e.target_pos.z - 1e-6);
            let d = Vec3::new(
                e.target_pos.x - e.current_pos.x,
                e.target_pos.y - e.current_pos.y,
                e.target_pos.z - e.current_pos.z,
            );
            let dist = d.len_sq();
            assert!(dist < prev || dist < 1e-10);
            prev = dist;
        }
    }

    #[test]
    fn big_step_snaps_exactly_to_target() {
        let mut rec = reconciler();
        rec.apply(vec![player(1, 0.0, 0.0, 0.0)]);
        rec.apply(vec![player(1, 4.0, 0.0, 0.0)]);
        // alpha = min(1, 10 × 0.5) = 1.
        rec.advance(0.5);
        let e = rec.get(1).unwrap();
        assert_eq!(e.current_pos, e.target_pos);
    }

    #[test]
    fn yaw_interpolates_the_short_way_through_zero() {
        let mut rec = reconciler();
        rec.apply(vec![player(1, 0.0, 0.0, 350f32.to_radians())]);
        rec.apply(vec![player(1, 0.0, 0.0, 10f32.to_radians())]);

        let mut remaining = f32::MAX;
        for _ in 0..30 {
            let before = rec.get(1).unwrap().current_yaw;
            rec.advance(0.01);
            let e = rec.get(1).unwrap();
            // Always rotating forward (positive wrapped step), never the
            // long way back through 180°.
            let step = wrap_angle(e.current_yaw - before);
            assert!(step >= -1e-6);
            assert!(step < 90f32.to_radians());

            let gap = wrap_angle(e.target_yaw - e.current_yaw).abs();
            assert!(gap <= remaining + 1e-6);
            remaining = gap;
        }
        assert!(remaining < 1f32.to_radians());
    }

    #[test]
    fn spec_scenario_partial_step_lands_halfway() {
        let mut rec = reconciler();

        // First appearance: no interpolation, rendered == target.
        rec.apply(vec![player(7, 1.0, 2.0, 0.0)]);
        rec.advance(0.1);
        assert_eq!(rec.get(7).unwrap().current_pos, Vec3::new(1.0, 0.0, 2.0));

        // Target moves to x=5; alpha = min(1, 10 × 0.05) = 0.5.
        rec.apply(vec![player(7, 5.0, 2.0, 0.0)]);
        rec.advance(0.05);
        let e = rec.get(7).unwrap();
        assert!((e.current_pos.x - 3.0).abs() < 1e-5);
        assert!((e.current_pos.z - 2.0).abs() < 1e-5);
    }

    #[test]
    fn marbles_track_without_orientation() {
        let mut rec: Reconciler<MarbleRecord> = Reconciler::new(InterpSpeeds::default());
        let summary = rec.apply(vec![MarbleRecord {
            id: Some(10),
            x: 3.0,
            z: 1.0,
            color: "red".into(),
            ..MarbleRecord::default()
        }]);
        assert_eq!(summary.spawned, vec![10]);
        let e = rec.get(10).unwrap();
        assert_eq!(e.current_pos, Vec3::new(3.0, 0.5, 1.0));
        assert_eq!(e.current_yaw, 0.0);
        assert_eq!(e.record.color, "red");
    }
}
