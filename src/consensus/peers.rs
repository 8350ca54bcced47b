use crate::network::node::Address;
use super::message::ParticipantId;

/// Immutable snapshot of every participant's address, in id order.
#[derive(Debug, Clone)]
pub struct Peers {
    pub members: Vec<Address>,
}

impl Peers {
    pub fn new(mut members: Vec<Address>) -> Self {
        members.sort_by_key(|address| address.id);
        Peers { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Address> {
        self.members.iter().find(|address| address.id == id)
    }

    pub fn is_member(&self, id: ParticipantId) -> bool {
        self.get(id).is_some()
    }

    /// Every member except `id`.
    pub fn others(&self, id: ParticipantId) -> impl Iterator<Item = &Address> {
        self.members.iter().filter(move |address| address.id != id)
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.members.iter().map(|address| address.id).collect()
    }
}

// Two views are the same view when they name the same participants.
impl PartialEq for Peers {
    fn eq(&self, other: &Self) -> bool {
        self.ids() == other.ids()
    }
}

/// Smallest set that intersects every other set of the same size: `⌊n/2⌋ + 1`.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    fn address(id: ParticipantId) -> Address {
        let (tx, _rx) = unbounded_channel();
        Address::new(id, tx)
    }

    #[test]
    fn test_members_sorted_by_id() {
        let peers = Peers::new(vec![address(3), address(1), address(2)]);
        assert_eq!(peers.ids(), vec![1, 2, 3]);
        assert!(peers.is_member(2));
        assert!(!peers.is_member(4));
    }

    #[test]
    fn test_others_excludes_self() {
        let peers = Peers::new(vec![address(1), address(2), address(3)]);
        let others: Vec<_> = peers.others(2).map(|address| address.id).collect();
        assert_eq!(others, vec![1, 3]);
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(10), 6);
    }
}
