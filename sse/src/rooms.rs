use crate::connection::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;

/// Anything that names one room or several rooms.
pub trait IntoRoomNames {
    fn into_room_names(self) -> Vec<String>;
}

impl IntoRoomNames for &str {
    fn into_room_names(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoRoomNames for String {
    fn into_room_names(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoRoomNames for &String {
    fn into_room_names(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl<S: AsRef<str>> IntoRoomNames for Vec<S> {
    fn into_room_names(self) -> Vec<String> {
        self.iter().map(|s| s.as_ref().to_string()).collect()
    }
}

impl<S: AsRef<str>> IntoRoomNames for &[S] {
    fn into_room_names(self) -> Vec<String> {
        self.iter().map(|s| s.as_ref().to_string()).collect()
    }
}

impl<S: AsRef<str>, const N: usize> IntoRoomNames for [S; N] {
    fn into_room_names(self) -> Vec<String> {
        self.iter().map(|s| s.as_ref().to_string()).collect()
    }
}

/// Room name to member ids. Rooms exist only while they have members.
pub struct RoomRegistry {
    rooms: DashMap<String, HashSet<ConnectionId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add `connection_id` to every room in `names`, returning the rooms
    /// that were created by this call.
    pub fn join(&self, connection_id: &ConnectionId, names: &[String]) -> Vec<String> {
        let mut created = Vec::new();
        for name in names {
            match self.rooms.entry(name.clone()) {
                Entry::Occupied(mut room) => {
                    room.get_mut().insert(connection_id.clone());
                }
                Entry::Vacant(room) => {
                    room.insert(HashSet::from([connection_id.clone()]));
                    created.push(name.clone());
                }
            }
        }
        created
    }

    /// Returns whether the connection was a member and whether the room was
    /// removed because it became empty.
    pub fn leave(&self, connection_id: &ConnectionId, name: &str) -> (bool, bool) {
        let was_member = match self.rooms.get_mut(name) {
            Some(mut members) => members.remove(connection_id),
            None => return (false, false),
        };

        // remove_if re-checks under the shard lock, so a concurrent join wins
        let emptied = self
            .rooms
            .remove_if(name, |_, members| members.is_empty())
            .is_some();

        (was_member, emptied)
    }

    /// Leave every room in `names`, returning the rooms that were removed.
    pub fn leave_all<I>(&self, connection_id: &ConnectionId, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        names
            .into_iter()
            .filter(|name| self.leave(connection_id, name).1)
            .collect()
    }

    /// De-duplicated union of the members of `names`.
    pub fn members_of_any(&self, names: &[String]) -> HashSet<ConnectionId> {
        let mut members = HashSet::new();
        for name in names {
            if let Some(room) = self.rooms.get(name) {
                members.extend(room.iter().cloned());
            }
        }
        members
    }

    pub fn members(&self, name: &str) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .rooms
            .get(name)
            .map(|room| room.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn member_count(&self, name: &str) -> usize {
        self.rooms.get(name).map(|room| room.len()).unwrap_or(0)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
