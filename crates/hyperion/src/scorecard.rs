/// Per-thread accumulators over the peptide ids of the chunk being
/// searched: matched b/y ion counts and summed intensities. Sized once to
/// the largest peptide table in the index and cleared only across the
/// touched `[minlimit, maxlimit]` slice after each chunk.
pub struct Scorecard {
    pub bc: Vec<u16>,
    pub yc: Vec<u16>,
    pub ibc: Vec<u64>,
    pub iyc: Vec<u64>,
}

impl Scorecard {
    pub fn new(capacity: usize) -> Self {
        Scorecard {
            bc: vec![0; capacity],
            yc: vec![0; capacity],
            ibc: vec![0; capacity],
            iyc: vec![0; capacity],
        }
    }

    pub fn len(&self) -> usize {
        self.bc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bc.is_empty()
    }

    #[inline]
    pub fn hit_b(&mut self, peptide: usize, intensity: u32) {
        self.bc[peptide] += 1;
        self.ibc[peptide] += intensity as u64;
    }

    #[inline]
    pub fn hit_y(&mut self, peptide: usize, intensity: u32) {
        self.yc[peptide] += 1;
        self.iyc[peptide] += intensity as u64;
    }

    /// Zero only the `[lo, hi]` slice touched by the last chunk sweep.
    pub fn clear_slice(&mut self, lo: usize, hi: usize) {
        self.bc[lo..=hi].fill(0);
        self.yc[lo..=hi].fill(0);
        self.ibc[lo..=hi].fill(0);
        self.iyc[lo..=hi].fill(0);
    }
}
