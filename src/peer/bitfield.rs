use bytes::Bytes;
use crate::error::{BittorrentError, Result};

/// Which pieces a peer holds. Bit 0 is the high bit of the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    #[cfg(test)]
    pub fn full(piece_count: usize) -> Self {
        let mut bitfield = Self {
            bits: vec![0xff; piece_count.div_ceil(8)],
            piece_count,
        };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Validate a received bitfield payload against the torrent's piece count.
    /// The payload must be exactly `ceil(piece_count / 8)` bytes; spare
    /// trailing bits are ignored.
    pub fn from_payload(payload: &[u8], piece_count: usize) -> Result<Self> {
        let expected = piece_count.div_ceil(8);
        if payload.len() != expected {
            return Err(BittorrentError::ProtocolFormat(format!(
                "Bitfield of {} bytes, expected {}",
                payload.len(),
                expected
            )));
        }

        let mut bitfield = Self {
            bits: payload.to_vec(),
            piece_count,
        };
        bitfield.clear_spare_bits();
        Ok(bitfield)
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Set the bit for `index`; returns true if it was previously clear
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count || self.has(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        true
    }

    /// Indices of every set bit, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has(i))
    }

    #[cfg(test)]
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if let Some(last) = self.bits.last_mut() {
            *last &= 0xffu8.checked_shl(spare as u32).unwrap_or(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut bf = Bitfield::new(10);
        assert!(bf.is_empty());
        assert!(bf.set(0));
        assert!(!bf.set(0));
        assert!(bf.set(9));
        assert!(!bf.set(10));
        assert!(bf.has(0) && bf.has(9) && !bf.has(5));
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![0, 9]);
        assert_eq!(bf.to_payload().as_ref(), &[0x80, 0x40]);
    }

    #[test]
    fn test_payload_length_is_checked() {
        assert!(Bitfield::from_payload(&[0xff], 9).is_err());
        assert!(Bitfield::from_payload(&[0xff, 0xff, 0], 9).is_err());
        assert!(Bitfield::from_payload(&[], 0).is_ok());
    }

    #[test]
    fn test_spare_bits_are_dropped() {
        let bf = Bitfield::from_payload(&[0xff, 0xff], 10).unwrap();
        assert_eq!(bf.count_ones(), 10);
        assert!(!bf.has(10));
        assert_eq!(Bitfield::full(10), bf);
    }
}
