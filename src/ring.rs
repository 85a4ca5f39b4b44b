//! Fixed-length circular buffer indexed relative to its centre.

/// Ring of `N` elements, `N` a power of two.
///
/// Elements are addressed by offset from the centre of the ring, which
/// trails the newest element by `N / 2` pushes. Offset 0 is the element
/// pushed `N / 2` pushes before the newest one; positive offsets are more
/// recent. This gives a filter symmetric look-ahead and look-behind around
/// the centre element at the cost of `N / 2` elements of delay.
pub struct Ring<T, const N: usize> {
    slots: Box<[T]>,
    /// Next slot to be written.
    head: usize,
}

impl<T: Clone, const N: usize> Ring<T, N> {
    pub fn new(fill: T) -> Self {
        assert!(N.is_power_of_two() && N >= 2, "ring length must be a power of two");
        Self { slots: vec![fill; N].into_boxed_slice(), head: 0 }
    }
}

impl<T, const N: usize> Ring<T, N> {
    const MASK: usize = N - 1;
    const CENTRE: isize = (N / 2) as isize;

    pub fn push(&mut self, value: T) {
        self.slots[self.head] = value;
        self.head = (self.head + 1) & Self::MASK;
    }

    /// Take the slot of the oldest element as the newest one, for filling
    /// in place.
    pub fn next_slot(&mut self) -> &mut T {
        let slot = self.head;
        self.head = (slot + 1) & Self::MASK;
        &mut self.slots[slot]
    }

    /// Element pushed `age` pushes before the newest one.
    pub fn newest(&self, age: usize) -> &T {
        debug_assert!(age < N);
        &self.slots[(self.head + N - 1 - age) & Self::MASK]
    }

    /// Element at `offset` from the centre, `-(N/2) < offset <= N/2`.
    pub fn get(&self, offset: isize) -> &T {
        debug_assert!(offset > -Self::CENTRE && offset <= Self::CENTRE);
        self.newest((Self::CENTRE - offset) as usize)
    }

    pub fn len(&self) -> usize {
        N
    }

    pub fn is_empty(&self) -> bool {
        N == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_and_centre() {
        let mut ring: Ring<u32, 8> = Ring::new(0);
        for i in 1..=8 {
            ring.push(i);
        }
        assert_eq!(*ring.newest(0), 8);
        assert_eq!(*ring.newest(7), 1);
        assert_eq!(*ring.get(0), 4);
        assert_eq!(*ring.get(1), 5);
        assert_eq!(*ring.get(4), 8);
        assert_eq!(*ring.get(-3), 1);
    }

    #[test]
    fn test_wraparound() {
        let mut ring: Ring<u32, 4> = Ring::new(0);
        for i in 1..=11 {
            ring.push(i);
        }
        assert_eq!(*ring.newest(0), 11);
        assert_eq!(*ring.get(0), 9);
        assert_eq!(*ring.get(-1), 8);
        assert_eq!(*ring.get(2), 11);
    }

    #[test]
    fn test_next_slot_fills_in_place() {
        let mut ring: Ring<Vec<u8>, 4> = Ring::new(vec![0; 2]);
        for i in 0..6u8 {
            let slot = ring.next_slot();
            slot[0] = i;
            slot[1] = i * 2;
        }
        assert_eq!(ring.newest(0), &vec![5, 10]);
        assert_eq!(ring.get(0), &vec![3, 6]);
    }
}
