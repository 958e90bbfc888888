//! Shared courier state.
//!
//! Every write goes through a single `DashMap` entry, so each operation is
//! atomic for its key. Iteration (`list_available`, `list`) walks the shards
//! one at a time and therefore reflects an approximate view: a courier may be
//! claimed by another task between being listed and being used. Callers that
//! act on a listed courier must go through [`CourierRegistry::try_mark_busy`].

use chrono::Utc;
use dashmap::DashMap;

use crate::geo::GeoPoint;
use crate::models::courier::{CourierRecord, CourierSnapshot};

pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Outcome of a successful stale release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleRelease {
    pub order_id: Option<String>,
}

#[derive(Default)]
pub struct CourierRegistry {
    couriers: DashMap<String, CourierRecord>,
    courier_by_order: DashMap<String, String>,
    order_by_courier: DashMap<String, String>,
}

impl CourierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_location(&self, courier_id: &str, lat: f64, lng: f64) {
        let now = now_epoch();
        let mut entry = self
            .couriers
            .entry(courier_id.to_string())
            .or_insert_with(|| CourierRecord::new(now));
        entry.location = Some(GeoPoint::new(lat, lng));
        entry.touch(now);
    }

    pub fn set_active(&self, courier_id: &str, active: bool) {
        let now = now_epoch();
        let mut entry = self
            .couriers
            .entry(courier_id.to_string())
            .or_insert_with(|| CourierRecord::new(now));
        entry.is_active = active;
        entry.touch(now);
    }

    pub fn set_busy(&self, courier_id: &str, busy: bool) {
        let now = now_epoch();
        let mut entry = self
            .couriers
            .entry(courier_id.to_string())
            .or_insert_with(|| CourierRecord::new(now));
        entry.is_busy = busy;
        entry.touch(now);
    }

    /// Atomically flips `is_busy` from false to true for an active courier.
    ///
    /// Returns false when the courier is unknown, offline, or already busy, which
    /// is how a dispatch that lost a race for the courier finds out.
    pub fn try_mark_busy(&self, courier_id: &str) -> bool {
        let Some(mut entry) = self.couriers.get_mut(courier_id) else {
            return false;
        };

        if !entry.is_available() {
            return false;
        }

        entry.is_busy = true;
        entry.touch(now_epoch());
        true
    }

    pub fn get(&self, courier_id: &str) -> Option<CourierSnapshot> {
        self.couriers.get(courier_id).map(|entry| CourierSnapshot {
            courier_id: entry.key().clone(),
            record: entry.value().clone(),
        })
    }

    /// Lazily yields couriers that are active and not busy.
    pub fn list_available(&self) -> impl Iterator<Item = CourierSnapshot> + '_ {
        self.couriers
            .iter()
            .filter(|entry| entry.value().is_available())
            .map(|entry| CourierSnapshot {
                courier_id: entry.key().clone(),
                record: entry.value().clone(),
            })
    }

    pub fn list(&self) -> Vec<CourierSnapshot> {
        let mut couriers: Vec<CourierSnapshot> = self
            .couriers
            .iter()
            .map(|entry| CourierSnapshot {
                courier_id: entry.key().clone(),
                record: entry.value().clone(),
            })
            .collect();
        couriers.sort_by(|a, b| a.courier_id.cmp(&b.courier_id));
        couriers
    }

    /// Ids of busy couriers whose last write is more than `stale_after_secs` old.
    pub fn stale_busy(&self, now: i64, stale_after_secs: i64) -> Vec<String> {
        self.couriers
            .iter()
            .filter(|entry| is_stale(entry.value(), now, stale_after_secs))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Releases the courier if it is still busy and stale at the moment of the
    /// write, returning the order it was bound to.
    ///
    /// The binding is removed before `is_busy` clears, both under the courier's
    /// entry guard, so a dispatch can only claim the courier once its old order
    /// is detached. `None` means this call did not release anything.
    pub fn release_if_stale(
        &self,
        courier_id: &str,
        now: i64,
        stale_after_secs: i64,
    ) -> Option<StaleRelease> {
        let mut entry = self.couriers.get_mut(courier_id)?;

        if !is_stale(entry.value(), now, stale_after_secs) {
            return None;
        }

        let order_id = self.unbind_courier(courier_id);
        entry.is_busy = false;
        entry.touch(now);
        Some(StaleRelease { order_id })
    }

    pub fn bind_order(&self, order_id: &str, courier_id: &str) {
        self.order_by_courier
            .insert(courier_id.to_string(), order_id.to_string());
        self.courier_by_order
            .insert(order_id.to_string(), courier_id.to_string());
    }

    pub fn courier_for_order(&self, order_id: &str) -> Option<String> {
        self.courier_by_order
            .get(order_id)
            .map(|entry| entry.value().clone())
    }

    pub fn order_for_courier(&self, courier_id: &str) -> Option<String> {
        self.order_by_courier
            .get(courier_id)
            .map(|entry| entry.value().clone())
    }

    /// Removes the courier's binding and returns the order it was bound to.
    pub fn unbind_courier(&self, courier_id: &str) -> Option<String> {
        let (_, order_id) = self.order_by_courier.remove(courier_id)?;
        self.courier_by_order
            .remove_if(&order_id, |_, bound| bound == courier_id);
        Some(order_id)
    }

    pub fn len(&self) -> usize {
        self.couriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.couriers.is_empty()
    }
}

fn is_stale(record: &CourierRecord, now: i64, stale_after_secs: i64) -> bool {
    record.is_busy && now - record.last_update > stale_after_secs
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn online(registry: &CourierRegistry, id: &str, lat: f64, lng: f64) {
        registry.set_active(id, true);
        registry.upsert_location(id, lat, lng);
    }

    #[test]
    fn unknown_courier_reads_as_none() {
        let registry = CourierRegistry::new();
        assert!(registry.get("ghost").is_none());
        assert!(!registry.try_mark_busy("ghost"));
    }

    #[test]
    fn upsert_location_keeps_flags() {
        let registry = CourierRegistry::new();
        registry.set_active("c1", true);
        registry.set_busy("c1", true);
        registry.upsert_location("c1", 40.0, -74.0);

        let snapshot = registry.get("c1").unwrap();
        assert!(snapshot.record.is_active);
        assert!(snapshot.record.is_busy);
        assert_eq!(snapshot.record.location, Some(GeoPoint::new(40.0, -74.0)));
    }

    #[test]
    fn list_available_skips_busy_and_inactive() {
        let registry = CourierRegistry::new();
        online(&registry, "free", 1.0, 1.0);
        online(&registry, "busy", 1.0, 1.0);
        registry.set_busy("busy", true);
        registry.upsert_location("offline", 1.0, 1.0);

        let ids: HashSet<String> = registry.list_available().map(|c| c.courier_id).collect();
        assert_eq!(ids, HashSet::from(["free".to_string()]));
    }

    #[test]
    fn try_mark_busy_succeeds_once() {
        let registry = CourierRegistry::new();
        online(&registry, "c1", 1.0, 1.0);

        assert!(registry.try_mark_busy("c1"));
        assert!(!registry.try_mark_busy("c1"));
        assert_eq!(registry.list_available().count(), 0);
    }

    #[test]
    fn courier_without_a_location_is_not_available() {
        let registry = CourierRegistry::new();
        registry.set_active("c1", true);

        assert!(registry.get("c1").unwrap().record.location.is_none());
        assert_eq!(registry.list_available().count(), 0);
        assert!(!registry.try_mark_busy("c1"));

        registry.upsert_location("c1", 40.0, -74.0);
        assert_eq!(registry.list_available().count(), 1);
    }

    #[test]
    fn try_mark_busy_refuses_inactive_courier() {
        let registry = CourierRegistry::new();
        registry.upsert_location("c1", 1.0, 1.0);
        assert!(!registry.try_mark_busy("c1"));
    }

    #[test]
    fn disconnect_leaves_busy_flag_alone() {
        let registry = CourierRegistry::new();
        online(&registry, "c1", 1.0, 1.0);
        assert!(registry.try_mark_busy("c1"));

        registry.set_active("c1", false);
        let record = registry.get("c1").unwrap().record;
        assert!(!record.is_active);
        assert!(record.is_busy);
    }

    #[test]
    fn release_if_stale_only_fires_once() {
        let registry = CourierRegistry::new();
        online(&registry, "c1", 1.0, 1.0);
        assert!(registry.try_mark_busy("c1"));
        let later = now_epoch() + 360;

        assert_eq!(registry.stale_busy(later, 300), vec!["c1".to_string()]);
        assert_eq!(
            registry.release_if_stale("c1", later, 300),
            Some(StaleRelease { order_id: None })
        );
        assert!(registry.release_if_stale("c1", later, 300).is_none());
        assert!(registry.stale_busy(later, 300).is_empty());
    }

    #[test]
    fn fresh_busy_courier_is_not_stale() {
        let registry = CourierRegistry::new();
        online(&registry, "c1", 1.0, 1.0);
        assert!(registry.try_mark_busy("c1"));

        assert!(registry.stale_busy(now_epoch() + 300, 300).is_empty());
        assert!(registry.release_if_stale("c1", now_epoch() + 10, 300).is_none());
    }

    #[test]
    fn last_update_never_moves_backwards() {
        let registry = CourierRegistry::new();
        online(&registry, "c1", 1.0, 1.0);
        assert!(registry.try_mark_busy("c1"));
        let ahead = now_epoch() + 1_000;
        registry.set_busy("c1", true);
        assert!(registry.release_if_stale("c1", ahead, 300).is_some());

        registry.upsert_location("c1", 2.0, 2.0);
        assert_eq!(registry.get("c1").unwrap().record.last_update, ahead);
    }

    #[test]
    fn bindings_round_trip() {
        let registry = CourierRegistry::new();
        registry.bind_order("o1", "c1");

        assert_eq!(registry.courier_for_order("o1").as_deref(), Some("c1"));
        assert_eq!(registry.order_for_courier("c1").as_deref(), Some("o1"));
        assert_eq!(registry.unbind_courier("c1").as_deref(), Some("o1"));
        assert!(registry.courier_for_order("o1").is_none());
        assert!(registry.unbind_courier("c1").is_none());
    }

    #[test]
    fn unbinding_an_old_courier_keeps_the_new_binding() {
        let registry = CourierRegistry::new();
        registry.bind_order("o1", "c1");
        registry.bind_order("o1", "c2");

        assert_eq!(registry.unbind_courier("c1").as_deref(), Some("o1"));
        assert_eq!(registry.courier_for_order("o1").as_deref(), Some("c2"));
    }

    #[test]
    fn stale_release_detaches_the_order_before_the_courier_is_free() {
        let registry = CourierRegistry::new();
        online(&registry, "c1", 1.0, 1.0);
        assert!(registry.try_mark_busy("c1"));
        registry.bind_order("o1", "c1");
        let later = now_epoch() + 360;

        let released = registry.release_if_stale("c1", later, 300);
        assert_eq!(
            released,
            Some(StaleRelease {
                order_id: Some("o1".to_string())
            })
        );
        assert!(registry.courier_for_order("o1").is_none());

        // a dispatch claiming the freed courier keeps its own binding
        assert!(registry.try_mark_busy("c1"));
        registry.bind_order("o2", "c1");
        assert_eq!(registry.courier_for_order("o2").as_deref(), Some("c1"));
        assert_eq!(registry.order_for_courier("c1").as_deref(), Some("o2"));
        assert!(registry.release_if_stale("c1", later, 300).is_none());
    }

    #[test]
    fn concurrent_sweeps_and_claims_never_lose_a_binding() {
        use std::sync::Arc;
        use std::thread;

        for round in 0..200 {
            let registry = Arc::new(CourierRegistry::new());
            online(&registry, "c1", 1.0, 1.0);
            assert!(registry.try_mark_busy("c1"));
            registry.bind_order("o1", "c1");
            let later = now_epoch() + 360;

            let sweeper = {
                let registry = registry.clone();
                thread::spawn(move || registry.release_if_stale("c1", later, 300))
            };
            let claimer = {
                let registry = registry.clone();
                thread::spawn(move || {
                    while !registry.try_mark_busy("c1") {
                        thread::yield_now();
                    }
                    registry.bind_order("o2", "c1");
                })
            };

            let released = sweeper.join().unwrap();
            claimer.join().unwrap();

            assert_eq!(
                released.and_then(|r| r.order_id).as_deref(),
                Some("o1"),
                "round {round}"
            );
            assert_eq!(registry.courier_for_order("o2").as_deref(), Some("c1"));
            assert!(registry.courier_for_order("o1").is_none());
        }
    }
}
