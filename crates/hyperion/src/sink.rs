use crate::error::Result;
use parking_lot::Mutex;
use serde::Serialize;

/// One reported peptide-spectrum match.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Psm {
    /// Global spectrum id, monotone across the whole input sequence
    pub spectrum_id: usize,
    pub precursor_mass: f32,
    pub peptide_len: u32,
    /// Stable peptide identity assigned by the index builder
    pub peptide: u32,
    pub hyperscore: f64,
    pub shared_ions: u16,
    pub total_ions: u16,
    /// Candidates considered for this spectrum
    pub cpsms: u32,
    /// Expected number of random matches at least this good
    pub expect: f64,
}

/// Where PSMs below the e-value ceiling go. Implementations serialize
/// concurrent reporters internally.
pub trait OutputSink: Send + Sync {
    fn report(&self, psm: &Psm) -> Result<()>;
}

/// In-memory sink for tests and library embedding.
#[derive(Default)]
pub struct VecSink {
    inner: Mutex<Vec<Psm>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn psms(&self) -> Vec<Psm> {
        self.inner.lock().clone()
    }
}

impl OutputSink for VecSink {
    fn report(&self, psm: &Psm) -> Result<()> {
        self.inner.lock().push(psm.clone());
        Ok(())
    }
}
