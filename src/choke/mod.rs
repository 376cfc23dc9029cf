use crate::piece::SessionMode;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Reciprocation slots, not counting the optimistic unchoke
pub const MAX_UNCHOKED: usize = 4;

/// What the scheduler needs to know about one peer for a round
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub am_choking: bool,
    pub peer_interested: bool,
    /// Bytes/s the peer sends us
    pub download_rate: f64,
    /// Bytes/s we send the peer
    pub upload_rate: f64,
}

/// Tit-for-tat upload slot allocation
pub struct ChokeScheduler {
    slots: usize,
}

impl ChokeScheduler {
    pub fn new(slots: usize) -> Self {
        Self { slots }
    }

    /// One scheduling round. Returns `(peer, unchoke)` only for peers whose
    /// choke state changes.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        peers: &[PeerSnapshot],
        mode: SessionMode,
        rng: &mut R,
    ) -> Vec<(SocketAddr, bool)> {
        if peers.len() <= self.slots {
            return peers
                .iter()
                .filter(|p| p.am_choking)
                .map(|p| (p.addr, true))
                .collect();
        }

        // seeding: reward whoever we can push data to fastest
        let rate = |p: &PeerSnapshot| match mode {
            SessionMode::Completed => p.upload_rate,
            _ => p.download_rate,
        };

        let mut ranked: Vec<&PeerSnapshot> = peers.iter().filter(|p| p.peer_interested).collect();
        ranked.sort_by(|a, b| rate(b).partial_cmp(&rate(a)).unwrap_or(Ordering::Equal));

        let mut unchoke: HashSet<SocketAddr> =
            ranked.iter().take(self.slots).map(|p| p.addr).collect();

        let hopefuls: Vec<SocketAddr> = ranked
            .iter()
            .skip(self.slots)
            .map(|p| p.addr)
            .collect();
        if let Some(&optimistic) = hopefuls.choose(rng) {
            unchoke.insert(optimistic);
        }

        peers
            .iter()
            .filter_map(|p| {
                let should = unchoke.contains(&p.addr);
                (should == p.am_choking).then_some((p.addr, should))
            })
            .collect()
    }
}

impl Default for ChokeScheduler {
    fn default() -> Self {
        Self::new(MAX_UNCHOKED)
    }
}
