use heapless::Vec;

/// Default receive buffer size, large enough for the longest register range we request.
pub const DEFAULT_CAPACITY: usize = 100;

/// Returned when an append would not fit. The buffer is left untouched.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Overflow {
    pub capacity: usize,
    pub attempted: usize,
}

/// A fixed-capacity buffer that notification fragments are appended to until
/// a whole frame is present.
#[derive(Debug, Default)]
pub struct Accumulator<const N: usize = DEFAULT_CAPACITY> {
    data: Vec<u8, N>,
}

impl<const N: usize> Accumulator<N> {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Append a fragment, failing closed if it would exceed capacity.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), Overflow> {
        let attempted = self.data.len() + chunk.len();
        if attempted > N {
            return Err(Overflow { capacity: N, attempted });
        }
        self.data
            .extend_from_slice(chunk)
            .map_err(|_| Overflow { capacity: N, attempted })
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

#[test]
fn test_append_until_full() {
    let mut acc = Accumulator::<8>::new();
    assert!(acc.append(&[1, 2, 3]).is_ok());
    assert!(acc.append(&[4, 5, 6, 7, 8]).is_ok());
    assert_eq!(acc.len(), 8);
    assert_eq!(acc.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_overflow_leaves_contents() {
    let mut acc = Accumulator::<4>::new();
    acc.append(&[1, 2, 3]).unwrap();
    assert_eq!(
        acc.append(&[4, 5]),
        Err(Overflow { capacity: 4, attempted: 5 })
    );
    assert_eq!(acc.as_slice(), &[1, 2, 3]);

    acc.clear();
    assert!(acc.is_empty());
    assert!(acc.append(&[9, 9, 9, 9]).is_ok());
}
