//! State shared by every replicated object.

use crate::counter::CounterUpdate;
use crate::map::MapUpdate;
use crate::{ObjectId, SiteCode, Timeserial, Timestamp};
use std::collections::BTreeMap;

/// Bookkeeping common to maps and counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub object_id: ObjectId,
    /// Latest serial per site already folded into the last synced state
    pub site_timeserials: BTreeMap<SiteCode, Timeserial>,
    /// Whether the create operation's initial value has been merged
    pub create_merged: bool,
    /// Set once the object has been deleted
    pub tombstoned_at: Option<Timestamp>,
}

impl ObjectMeta {
    pub fn new(object_id: impl Into<ObjectId>) -> Self {
        Self {
            object_id: object_id.into(),
            site_timeserials: BTreeMap::new(),
            create_merged: false,
            tombstoned_at: None,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }

    /// Whether an operation from `site` with `serial` is already contained in
    /// the synced state.
    pub fn already_synced(&self, site: &str, serial: &Timeserial) -> bool {
        self.site_timeserials
            .get(site)
            .is_some_and(|synced| serial <= synced)
    }

    /// Reset from a synced state.
    pub fn replace(&mut self, site_timeserials: &BTreeMap<SiteCode, String>) {
        self.site_timeserials = site_timeserials
            .iter()
            .filter_map(|(site, serial)| {
                Timeserial::from_wire(Some(serial)).map(|s| (site.clone(), s))
            })
            .collect();
        self.create_merged = false;
    }
}

/// A visible change to one object, delivered to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectUpdate {
    Map(MapUpdate),
    Counter(CounterUpdate),
    /// The object was deleted
    Deleted,
}
