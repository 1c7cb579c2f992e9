//! Two equal-size buffers for pipeline depth 1.
//!
//! One side is being filled (disk read on the sender, socket receive on the
//! receiver) while the other is drained (socket send, disk write). The loop
//! owns the `DoubleBuffer`, takes both sides with `split_mut()` for one
//! iteration, joins both operations, then calls `switch()`.

pub struct DoubleBuffer {
    halves: [Vec<u8>; 2],
    fill: usize,
}

impl DoubleBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            halves: [vec![0u8; size], vec![0u8; size]],
            fill: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.halves[0].len()
    }

    /// Swap roles: the side just filled becomes the drain side.
    pub fn switch(&mut self) {
        self.fill ^= 1;
    }

    pub fn fill_mut(&mut self) -> &mut [u8] {
        &mut self.halves[self.fill]
    }

    pub fn drain(&self) -> &[u8] {
        &self.halves[self.fill ^ 1]
    }

    /// Borrow both sides at once: `(fill, drain)`.
    pub fn split_mut(&mut self) -> (&mut [u8], &[u8]) {
        let [a, b] = &mut self.halves;
        if self.fill == 0 {
            (a.as_mut_slice(), b.as_slice())
        } else {
            (b.as_mut_slice(), a.as_slice())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_moves_filled_side_to_drain() {
        let mut buffers = DoubleBuffer::new(4);
        assert_eq!(buffers.capacity(), 4);
        buffers.fill_mut().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buffers.drain(), &[0, 0, 0, 0]);
        buffers.switch();
        assert_eq!(buffers.drain(), &[1, 2, 3, 4]);

        let (fill, drain) = buffers.split_mut();
        fill.copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(drain, &[1, 2, 3, 4]);

        buffers.switch();
        assert_eq!(buffers.drain(), &[9, 9, 9, 9]);
        assert_eq!(buffers.fill_mut(), &[1, 2, 3, 4]);
    }
}
