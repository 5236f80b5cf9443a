//! Stable storage for per-part etag strings.
//!
//! The registry is an append-only arena: the manifest references slots by
//! `EtagRef` and workers fill them in once the remote acknowledges a part.
//! Slots are never moved or dropped individually, so references stay valid
//! for the life of the registry.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtagRef(usize);

#[derive(Debug)]
struct EtagEntity {
    part_num: i32,
    etag: Option<String>,
}

#[derive(Debug, Default)]
pub struct EtagRegistry {
    entities: Vec<EtagEntity>,
}

impl EtagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty slot for `part_num` and return its handle.
    pub fn add(&mut self, part_num: i32) -> EtagRef {
        self.entities.push(EtagEntity {
            part_num,
            etag: None,
        });
        EtagRef(self.entities.len() - 1)
    }

    /// Record the etag the remote returned for this slot.
    pub fn set(&mut self, etag_ref: EtagRef, etag: String) {
        if let Some(entity) = self.entities.get_mut(etag_ref.0) {
            entity.etag = Some(etag);
        }
    }

    /// The recorded etag, or None while the part is still in flight.
    pub fn get(&self, etag_ref: EtagRef) -> Option<&str> {
        self.entities
            .get(etag_ref.0)
            .and_then(|entity| entity.etag.as_deref())
    }

    pub fn part_num(&self, etag_ref: EtagRef) -> Option<i32> {
        self.entities.get(etag_ref.0).map(|entity| entity.part_num)
    }

    pub fn contains(&self, etag_ref: EtagRef) -> bool {
        etag_ref.0 < self.entities.len()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_stay_valid_as_the_registry_grows() {
        let mut registry = EtagRegistry::new();
        let first = registry.add(1);
        for part_num in 2..100 {
            registry.add(part_num);
        }
        registry.set(first, "\"abc\"".to_string());
        assert_eq!(registry.get(first), Some("\"abc\""));
        assert_eq!(registry.part_num(first), Some(1));
    }

    #[test]
    fn unset_slots_read_as_none() {
        let mut registry = EtagRegistry::new();
        let slot = registry.add(7);
        assert_eq!(registry.get(slot), None);
        assert!(registry.contains(slot));
    }

    #[test]
    fn clear_invalidates_old_refs() {
        let mut registry = EtagRegistry::new();
        let slot = registry.add(1);
        registry.clear();
        assert!(!registry.contains(slot));
        assert_eq!(registry.get(slot), None);
        // A stale set is ignored rather than resurrecting the slot.
        registry.set(slot, "\"zzz\"".to_string());
        assert!(registry.is_empty());
    }
}
