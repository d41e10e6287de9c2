//! Roster-driven set of fridge cards.
//!
//! The collection fetches the roster, keeps one mounted card per device id
//! and sorts rows on the client without re-fetching.

use super::Device;
use super::card::{CardSnapshot, FridgeCard};
use super::liveness::LivenessSettings;
use crate::api::models::Fridge;
use crate::error::Result;
use crate::telemetry::TelemetryStore;
use async_trait::async_trait;
use log::{error, info, warn};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use strum::{Display, EnumString};

/// Where the fridge roster comes from.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn fetch_roster(&self) -> Result<Vec<Fridge>>;
}

/// Client-side sort order for the fridge list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SortKey {
    /// Numeric account, non-numeric accounts after.
    #[default]
    Number,
    /// Available fridges first.
    Availability,
    Address,
    /// Missing owner last.
    Owner,
}

/// Sort `fridges` by `key`. Stable: ties keep roster order.
pub fn sort_fridges(
    fridges: &[Fridge],
    key: SortKey,
    is_available: impl Fn(&str) -> bool,
) -> Vec<Fridge> {
    let mut sorted = fridges.to_vec();
    match key {
        SortKey::Number => sorted.sort_by(|a, b| compare_accounts(&a.account, &b.account)),
        SortKey::Availability => {
            sorted.sort_by_key(|f| !is_available(f.device_id()));
        }
        SortKey::Address => sorted.sort_by(|a, b| a.address.cmp(&b.address)),
        SortKey::Owner => sorted.sort_by(|a, b| match (&a.owner, &b.owner) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }),
    }
    sorted
}

fn compare_accounts(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// One rendered row: roster entry plus its card state, if mounted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FridgeRow {
    pub fridge: Fridge,
    pub snapshot: Option<CardSnapshot>,
}

impl FridgeRow {
    pub fn is_available(&self) -> bool {
        self.snapshot.as_ref().is_some_and(|s| s.available)
    }
}

/// What a roster refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterChange {
    pub mounted: Vec<String>,
    pub unmounted: Vec<String>,
    pub failed: Vec<String>,
}

impl RosterChange {
    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty() && self.unmounted.is_empty() && self.failed.is_empty()
    }
}

pub struct FridgeCollection {
    source: Arc<dyn RosterSource>,
    store: Arc<dyn TelemetryStore>,
    settings: LivenessSettings,
    roster: Vec<Fridge>,
    cards: HashMap<String, FridgeCard>,
}

impl FridgeCollection {
    pub fn new(
        source: Arc<dyn RosterSource>,
        store: Arc<dyn TelemetryStore>,
        settings: LivenessSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            roster: Vec::new(),
            cards: HashMap::new(),
        }
    }

    /// Fetch the roster and reconcile mounted cards with it.
    ///
    /// On fetch failure the previous roster and cards stay as they are.
    /// Cards that fail to mount are reported and retried on the next refresh.
    pub async fn refresh(&mut self) -> Result<RosterChange> {
        let fetched = match self.source.fetch_roster().await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("Roster fetch failed, keeping {} fridges: {}", self.roster.len(), e);
                return Err(e);
            }
        };

        let mut seen = HashSet::new();
        let roster: Vec<Fridge> = fetched
            .into_iter()
            .filter(|f| {
                let fresh = seen.insert(f.device_id().to_string());
                if !fresh {
                    warn!("Duplicate fridge account {} in roster, ignoring", f.account);
                }
                fresh
            })
            .collect();

        let mut change = RosterChange::default();

        let removed: Vec<String> = self
            .cards
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(mut card) = self.cards.remove(&id) {
                card.unmount();
            }
            change.unmounted.push(id);
        }

        for fridge in &roster {
            let id = fridge.device_id();
            if self.cards.contains_key(id) {
                continue;
            }
            match FridgeCard::mount(Device::from(fridge), self.store.clone(), self.settings).await
            {
                Ok(card) => {
                    self.cards.insert(id.to_string(), card);
                    change.mounted.push(id.to_string());
                }
                Err(e) => {
                    error!("[Fridge {}] Mount failed: {}", id, e);
                    change.failed.push(id.to_string());
                }
            }
        }

        self.roster = roster;
        if !change.is_empty() {
            info!(
                "Roster refreshed: {} fridges ({} mounted, {} unmounted, {} failed)",
                self.roster.len(),
                change.mounted.len(),
                change.unmounted.len(),
                change.failed.len()
            );
        }
        Ok(change)
    }

    pub fn roster(&self) -> &[Fridge] {
        &self.roster
    }

    pub fn is_available(&self, id: &str) -> bool {
        self.cards.get(id).is_some_and(|c| c.snapshot().available)
    }

    /// Sorted rows from the current roster and card states.
    pub fn view(&self, key: SortKey) -> Vec<FridgeRow> {
        sort_fridges(&self.roster, key, |id| self.is_available(id))
            .into_iter()
            .map(|fridge| FridgeRow {
                snapshot: self.cards.get(fridge.device_id()).map(FridgeCard::snapshot),
                fridge,
            })
            .collect()
    }

    pub fn card(&self, id: &str) -> Option<&FridgeCard> {
        self.cards.get(id)
    }

    pub fn cards(&self) -> impl Iterator<Item = &FridgeCard> {
        self.cards.values()
    }

    /// Unmount every card.
    pub fn shutdown(&mut self) {
        for (_, mut card) in self.cards.drain() {
            card.unmount();
        }
        info!("All fridge cards unmounted");
    }
}

impl Drop for FridgeCollection {
    fn drop(&mut self) {
        if !self.cards.is_empty() {
            self.shutdown();
        }
    }
}
