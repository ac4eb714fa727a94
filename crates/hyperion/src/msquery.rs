use crate::error::Result;
use crate::spectrum::SpectrumBatch;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Contract the search pipeline consumes from the spectrum parser: a
/// pre-scanned spectra/chunk count, then repeated chunk extraction into a
/// caller-owned batch.
pub trait SpectrumSource: Send {
    /// Number of accepted spectra this file will yield.
    fn spectra_count(&self) -> usize;
    /// Number of batches this file will produce.
    fn chunk_count(&self) -> usize;
    /// Append up to `limit` spectra to `batch`; returns how many were added.
    fn read_chunk(&mut self, limit: usize, batch: &mut SpectrumBatch) -> Result<usize>;
}

/// One input file plus its extraction cursor and pre-assigned batch-number
/// range. Mutated only by the I/O worker currently holding it.
pub struct QueryFile {
    pub source: Box<dyn SpectrumSource>,
    pub path: String,
    pub file_index: usize,
    pub remaining: usize,
    /// Batch number the next extracted chunk will carry
    pub next_batch: usize,
}

impl QueryFile {
    pub fn new(source: Box<dyn SpectrumSource>, path: String, file_index: usize) -> Self {
        let remaining = source.spectra_count();
        QueryFile {
            source,
            path,
            file_index,
            remaining,
            next_batch: 0,
        }
    }

    /// Fill `batch` with the next chunk; stamps the batch number and file
    /// index and advances the cursor.
    pub fn extract(&mut self, limit: usize, batch: &mut SpectrumBatch) -> Result<usize> {
        let n = self.source.read_chunk(limit, batch)?;
        if n == 0 {
            // The file ended earlier than the scan promised
            self.remaining = 0;
        } else {
            self.remaining = self.remaining.saturating_sub(n);
        }
        batch.batch_num = self.next_batch;
        batch.file_index = self.file_index;
        self.next_batch += 1;
        Ok(n)
    }

    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }
}

/// Assign globally monotone batch numbers across all files and return
/// `(total spectra, total batches)`.
pub fn assign_batch_numbers(files: &mut [QueryFile]) -> (usize, usize) {
    let mut total_spectra = 0;
    let mut next = 0;
    for file in files.iter_mut() {
        file.next_batch = next;
        next += file.source.chunk_count();
        total_spectra += file.source.spectra_count();
    }
    (total_spectra, next)
}

/// FIFO of input files behind one mutex; shared by the I/O workers. Also
/// used as the park queue that holds preempted files.
#[derive(Default)]
pub struct FileQueue {
    inner: Mutex<VecDeque<QueryFile>>,
}

impl FileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, file: QueryFile) {
        self.inner.lock().push_back(file);
    }

    pub fn pop(&self) -> Option<QueryFile> {
        self.inner.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
