//! Shared roster of room members.
//!
//! The local member is held separately and is authoritative only here.
//! Remote members live in a [`RosterStore`] and converge by
//! last-writer-wins on `revision`:
//!
//! | Incoming vs stored        | Outcome     |
//! |---------------------------|-------------|
//! | unknown user              | `Inserted`  |
//! | lower revision            | `Stale`     |
//! | same content              | `Unchanged` |
//! | equal or higher revision  | `Updated`   |
//! | local user id             | `Ignored`   |
//!
//! Connection status is tracked beside the roster and never replicated.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::protocol::{Member, PeerAddress};

/// Storage for remote members, keyed by user id.
pub trait RosterStore: Send {
    fn get(&self, user_id: &Uuid) -> Option<&Member>;
    fn put(&mut self, member: Member) -> Option<Member>;
    fn remove(&mut self, user_id: &Uuid) -> Option<Member>;
    fn members(&self) -> Vec<&Member>;
    fn retain(&mut self, keep: &mut dyn FnMut(&Member) -> bool);

    fn len(&self) -> usize {
        self.members().len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRosterStore {
    members: HashMap<Uuid, Member>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RosterStore for MemoryRosterStore {
    fn get(&self, user_id: &Uuid) -> Option<&Member> {
        self.members.get(user_id)
    }

    fn put(&mut self, member: Member) -> Option<Member> {
        self.members.insert(member.user_id, member)
    }

    fn remove(&mut self, user_id: &Uuid) -> Option<Member> {
        self.members.remove(user_id)
    }

    fn members(&self) -> Vec<&Member> {
        self.members.values().collect()
    }

    fn retain(&mut self, keep: &mut dyn FnMut(&Member) -> bool) {
        self.members.retain(|_, m| keep(m));
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// Connection status of a member as seen from this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Errored,
    /// No channel has been seen yet.
    #[default]
    Offline,
}

/// Outcome of [`Roster::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
    Stale,
    Ignored,
}

impl Upsert {
    pub fn changed(self) -> bool {
        matches!(self, Upsert::Inserted | Upsert::Updated)
    }
}

/// What a snapshot changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub joined: Vec<Member>,
    pub updated: Vec<Member>,
    pub left: Vec<Member>,
}

/// A member together with its status, for display.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub member: Member,
    pub status: ConnectionStatus,
    pub local: bool,
}

pub struct Roster<S: RosterStore = MemoryRosterStore> {
    local: Member,
    store: S,
    statuses: HashMap<Uuid, ConnectionStatus>,
}

impl Roster<MemoryRosterStore> {
    pub fn new(local: Member) -> Self {
        Self::with_store(local, MemoryRosterStore::new())
    }
}

impl<S: RosterStore> Roster<S> {
    pub fn with_store(local: Member, store: S) -> Self {
        Self {
            local,
            store,
            statuses: HashMap::new(),
        }
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut Member {
        &mut self.local
    }

    pub fn local_id(&self) -> Uuid {
        self.local.user_id
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&Member> {
        if *user_id == self.local.user_id {
            Some(&self.local)
        } else {
            self.store.get(user_id)
        }
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.get(user_id).is_some()
    }

    /// Number of members, local included.
    pub fn len(&self) -> usize {
        self.store.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Last-writer-wins upsert of a remote member.
    pub fn upsert(&mut self, incoming: Member) -> Upsert {
        if incoming.user_id == self.local.user_id {
            return Upsert::Ignored;
        }

        let mut incoming = incoming;
        let outcome = match self.store.get(&incoming.user_id) {
            None => Upsert::Inserted,
            Some(existing) if incoming.revision < existing.revision => return Upsert::Stale,
            Some(existing) => {
                if incoming.address.is_none() {
                    incoming.address = existing.address.clone();
                }
                if &incoming == existing {
                    return Upsert::Unchanged;
                }
                Upsert::Updated
            }
        };

        if let Some(address) = incoming.address.clone() {
            self.release_address(&address, incoming.user_id);
        }
        self.store.put(incoming);
        outcome
    }

    /// Record that `user_id` is reachable at `address`.
    pub fn bind_address(&mut self, user_id: &Uuid, address: PeerAddress) -> bool {
        let Some(member) = self.store.get(user_id) else {
            return false;
        };
        if member.address.as_ref() == Some(&address) {
            return false;
        }
        let mut member = member.clone();
        self.release_address(&address, *user_id);
        member.address = Some(address);
        self.store.put(member);
        true
    }

    /// Strip `address` from every member other than `owner`; slots get reused.
    fn release_address(&mut self, address: &PeerAddress, owner: Uuid) {
        let stale: Vec<Member> = self
            .store
            .members()
            .into_iter()
            .filter(|m| m.user_id != owner && m.address.as_ref() == Some(address))
            .cloned()
            .collect();
        for mut member in stale {
            member.address = None;
            self.store.put(member);
        }
    }

    pub fn remove(&mut self, user_id: &Uuid) -> Option<Member> {
        self.statuses.remove(user_id);
        self.store.remove(user_id)
    }

    /// Reconcile against a full snapshot.
    ///
    /// Remote entries missing from the snapshot are dropped unless their
    /// id is in `keep`. The local entry always survives.
    pub fn apply_snapshot(&mut self, members: Vec<Member>, keep: &HashSet<Uuid>) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        let mut seen = HashSet::new();

        for member in members {
            let user_id = member.user_id;
            seen.insert(user_id);
            match self.upsert(member) {
                Upsert::Inserted => diff.joined.extend(self.store.get(&user_id).cloned()),
                Upsert::Updated => diff.updated.extend(self.store.get(&user_id).cloned()),
                _ => {}
            }
        }

        let mut left = Vec::new();
        self.store.retain(&mut |m: &Member| {
            let stays = seen.contains(&m.user_id) || keep.contains(&m.user_id);
            if !stays {
                left.push(m.clone());
            }
            stays
        });
        for member in &left {
            self.statuses.remove(&member.user_id);
        }
        diff.left = left;
        diff
    }

    pub fn find_by_address(&self, address: &PeerAddress) -> Option<&Member> {
        if self.local.address.as_ref() == Some(address) {
            return Some(&self.local);
        }
        self.store
            .members()
            .into_iter()
            .find(|m| m.address.as_ref() == Some(address))
    }

    /// All members, local first, the rest ordered by name.
    pub fn members(&self) -> Vec<Member> {
        let mut remote: Vec<Member> = self.store.members().into_iter().cloned().collect();
        remote.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_id.cmp(&b.user_id)));
        let mut all = Vec::with_capacity(remote.len() + 1);
        all.push(self.local.clone());
        all.extend(remote);
        all
    }

    /// Members with their status, in [`Roster::members`] order.
    pub fn entries(&self) -> Vec<RosterEntry> {
        let local_id = self.local.user_id;
        self.members()
            .into_iter()
            .map(|member| RosterEntry {
                status: self.status(&member.user_id),
                local: member.user_id == local_id,
                member,
            })
            .collect()
    }

    /// Set a member's status. Returns whether it changed.
    pub fn set_status(&mut self, user_id: Uuid, status: ConnectionStatus) -> bool {
        let previous = self.statuses.insert(user_id, status);
        previous.unwrap_or_default() != status
    }

    pub fn status(&self, user_id: &Uuid) -> ConnectionStatus {
        self.statuses.get(user_id).copied().unwrap_or_default()
    }

    /// Known addresses of remote members other than `except`.
    pub fn peer_addresses_except(&self, except: &Uuid) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .store
            .members()
            .into_iter()
            .filter(|m| m.user_id != *except)
            .filter_map(|m| m.address.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Remote user ids.
    pub fn remote_ids(&self) -> Vec<Uuid> {
        self.store.members().into_iter().map(|m| m.user_id).collect()
    }

    /// Mean of every member's locations, as `(lat, lng)`.
    pub fn midpoint(&self) -> Option<(f64, f64)> {
        let (mut lat, mut lng, mut count) = (0.0, 0.0, 0usize);
        let remote = self.store.members();
        for location in std::iter::once(&self.local)
            .chain(remote)
            .flat_map(|m| m.locations.iter())
        {
            lat += location.lat;
            lng += location.lng;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some((lat / count as f64, lng / count as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Location, LocationSource, RoomId};

    fn addr(slot: u32) -> PeerAddress {
        PeerAddress::new(RoomId::parse("roster-room").unwrap(), slot)
    }

    fn member(name: &str) -> Member {
        Member::new(name)
    }

    #[test]
    fn test_upsert_lww() {
        let mut roster = Roster::new(member("Local"));
        let mut bob = member("Bob");
        bob.revision = 2;

        assert_eq!(roster.upsert(bob.clone()), Upsert::Inserted);
        assert_eq!(roster.upsert(bob.clone()), Upsert::Unchanged);

        let mut older = bob.clone();
        older.revision = 1;
        older.name = "Old Bob".into();
        assert_eq!(roster.upsert(older), Upsert::Stale);
        assert_eq!(roster.get(&bob.user_id).unwrap().name, "Bob");

        let mut newer = bob.clone();
        newer.rename("Robert");
        assert_eq!(roster.upsert(newer), Upsert::Updated);
        assert_eq!(roster.get(&bob.user_id).unwrap().name, "Robert");
    }

    #[test]
    fn test_upsert_ignores_local_id() {
        let local = member("Local");
        let mut roster = Roster::new(local.clone());
        let mut impostor = local.clone();
        impostor.name = "Impostor".into();
        impostor.revision = 99;

        assert_eq!(roster.upsert(impostor), Upsert::Ignored);
        assert_eq!(roster.local().name, "Local");
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_upsert_keeps_known_address() {
        let mut roster = Roster::new(member("Local"));
        let mut bob = member("Bob");
        bob.address = Some(addr(1));
        roster.upsert(bob.clone());

        bob.address = None;
        bob.add_location(Location::new(1.0, 2.0, "Here", LocationSource::Current));
        assert_eq!(roster.upsert(bob.clone()), Upsert::Updated);
        assert_eq!(roster.get(&bob.user_id).unwrap().address, Some(addr(1)));
    }

    #[test]
    fn test_reused_slot_moves_address() {
        let mut roster = Roster::new(member("Local"));
        let mut old = member("Old");
        old.address = Some(addr(2));
        roster.upsert(old.clone());

        let new = member("New");
        roster.upsert(new.clone());
        assert!(roster.bind_address(&new.user_id, addr(2)));

        assert_eq!(roster.find_by_address(&addr(2)).unwrap().user_id, new.user_id);
        assert_eq!(roster.get(&old.user_id).unwrap().address, None);
    }

    #[test]
    fn test_snapshot_replaces_but_keeps_local_and_open() {
        let local = member("Local");
        let mut roster = Roster::new(local.clone());
        let gone = member("Gone");
        let direct = member("Direct");
        roster.upsert(gone.clone());
        roster.upsert(direct.clone());

        let host = member("Host");
        let keep: HashSet<Uuid> = [direct.user_id].into_iter().collect();
        let diff = roster.apply_snapshot(vec![host.clone(), local.clone()], &keep);

        assert_eq!(diff.joined, vec![host.clone()]);
        assert_eq!(diff.left, vec![gone.clone()]);
        assert!(roster.contains(&local.user_id));
        assert!(roster.contains(&direct.user_id));
        assert!(!roster.contains(&gone.user_id));
        assert_eq!(roster.len(), 3);
    }

    #[test]
    fn test_status_defaults_to_offline() {
        let mut roster = Roster::new(member("Local"));
        let bob = member("Bob");
        roster.upsert(bob.clone());

        assert_eq!(roster.status(&bob.user_id), ConnectionStatus::Offline);
        assert!(roster.set_status(bob.user_id, ConnectionStatus::Connected));
        assert!(!roster.set_status(bob.user_id, ConnectionStatus::Connected));
        roster.remove(&bob.user_id);
        assert_eq!(roster.status(&bob.user_id), ConnectionStatus::Offline);
    }

    #[test]
    fn test_members_local_first_then_by_name() {
        let mut roster = Roster::new(member("Zed"));
        roster.upsert(member("Bob"));
        roster.upsert(member("Alice"));

        let names: Vec<String> = roster.members().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["Zed", "Alice", "Bob"]);

        let entries = roster.entries();
        assert!(entries[0].local);
        assert!(!entries[1].local);
    }

    #[test]
    fn test_midpoint() {
        let mut local = member("Local");
        let mut roster = Roster::new(local.clone());
        assert_eq!(roster.midpoint(), None);

        local.add_location(Location::new(10.0, 20.0, "A", LocationSource::Current));
        *roster.local_mut() = local;
        let mut bob = member("Bob");
        bob.add_location(Location::new(20.0, 40.0, "B", LocationSource::Geocoded));
        roster.upsert(bob);

        assert_eq!(roster.midpoint(), Some((15.0, 30.0)));
    }

    #[test]
    fn test_peer_addresses_except() {
        let mut roster = Roster::new(member("Local"));
        let mut a = member("A");
        a.address = Some(addr(2));
        let mut b = member("B");
        b.address = Some(addr(1));
        let c = member("C");
        roster.upsert(a.clone());
        roster.upsert(b.clone());
        roster.upsert(c);

        assert_eq!(roster.peer_addresses_except(&a.user_id), vec![addr(1)]);
        assert_eq!(roster.peer_addresses_except(&Uuid::nil()), vec![addr(1), addr(2)]);
    }
}
