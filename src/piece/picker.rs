use super::{PieceState, PieceStore};
use crate::peer::Bitfield;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::BTreeSet;
use tracing::info;

/// Download phase of a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Normal,
    /// Remaining pieces are requested from every peer that has them
    Endgame,
    /// Every piece verified
    Completed,
}

struct SelectorState {
    mode: SessionMode,
    /// Endgame candidates, snapshotted when endgame starts
    missing: BTreeSet<usize>,
}

/// Chooses the next piece a peer should fetch.
///
/// Holds its own lock across a whole selection so two peers never claim
/// the same piece in normal mode. Lock order is selector, then piece.
pub struct PieceSelector {
    state: Mutex<SelectorState>,
}

impl PieceSelector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SelectorState {
                mode: SessionMode::Normal,
                missing: BTreeSet::new(),
            }),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.state.lock().mode
    }

    pub fn pick(&self, store: &PieceStore, available: &Bitfield) -> Option<usize> {
        self.pick_with(store, available, &mut rand::thread_rng())
    }

    /// Claim a piece `available` advertises. In normal mode this is the
    /// rarest pending piece, lowest index first on ties; in endgame any
    /// missing piece, chosen uniformly.
    pub fn pick_with<R: Rng + ?Sized>(
        &self,
        store: &PieceStore,
        available: &Bitfield,
        rng: &mut R,
    ) -> Option<usize> {
        let mut state = self.state.lock();

        let picked = match state.mode {
            SessionMode::Completed => None,
            SessionMode::Normal => {
                let mut best: Option<(u32, usize)> = None;
                for index in available.iter_set().filter(|&i| i < store.len()) {
                    let piece = store.piece(index);
                    if piece.state != PieceState::Pending {
                        continue;
                    }
                    if best.map_or(true, |(rarity, _)| piece.rarity < rarity) {
                        best = Some((piece.rarity, index));
                    }
                }
                best.map(|(_, index)| index)
            }
            SessionMode::Endgame => state
                .missing
                .iter()
                .copied()
                .filter(|&i| available.has(i) && !store.is_complete(i))
                .choose(rng),
        }?;

        {
            let mut piece = store.piece(picked);
            piece.claimants += 1;
            if piece.state == PieceState::Pending {
                piece.state = PieceState::Active;
            }
        }

        if state.mode == SessionMode::Normal {
            Self::enter_endgame_if_due(&mut state, store);
        }
        Some(picked)
    }

    /// Switch to endgame once every piece but at most one is complete or
    /// in flight. Returns true on the transition.
    pub fn check_endgame(&self, store: &PieceStore) -> bool {
        let mut state = self.state.lock();
        state.mode == SessionMode::Normal && Self::enter_endgame_if_due(&mut state, store)
    }

    fn enter_endgame_if_due(state: &mut SelectorState, store: &PieceStore) -> bool {
        let (done, active) = store.counts();
        let total = store.len();
        if done == total || done + active < total.saturating_sub(1) {
            return false;
        }

        // active pieces are included so a stalled fetch can be raced
        state.missing = (0..total).filter(|&i| !store.is_complete(i)).collect();
        state.mode = SessionMode::Endgame;
        info!("Entering endgame with {} pieces left", state.missing.len());
        true
    }

    pub fn piece_completed(&self, index: usize) {
        self.state.lock().missing.remove(&index);
    }

    pub fn set_completed(&self) {
        let mut state = self.state.lock();
        state.mode = SessionMode::Completed;
        state.missing.clear();
    }

    #[cfg(test)]
    pub fn missing(&self) -> Vec<usize> {
        self.state.lock().missing.iter().copied().collect()
    }
}

impl Default for PieceSelector {
    fn default() -> Self {
        Self::new()
    }
}
