//! Cross-shard exchange of per-spectrum distribution parameters and
//! candidate PSMs. Each scored batch is staged into a ring slot and
//! persisted by a dedicated writer thread as
//! `{workspace}/{batch_num}_{rank}.dat`; after all shards have staged
//! their batches, [`merge_staged`] folds the histograms together and
//! re-derives e-values against the union.

use crate::error::{EngineError, Result};
use crate::expect::{TailFit, HISTOGRAM_SIZE, SURVIVAL_SAMPLES};
use crate::sink::{OutputSink, Psm};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::warn;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Staging ring depth.
pub const NSTAGE: usize = 4;

/// Per-spectrum distribution descriptor shipped between shards.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PartialHits {
    /// Smallest populated survival bucket
    pub min: u16,
    /// Bucket of the best hyperscore
    pub max: u16,
    /// Bucket of the runner-up
    pub max2: u16,
    /// Candidates that passed the shared-peak filter
    pub n: u32,
    pub query_id: u32,
}

/// The shard-local top candidate for one spectrum, already resolved to a
/// stable peptide identity so the merge phase needs no index access.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Candidate {
    pub hyperscore: f64,
    pub peptide_len: u32,
    pub peptide: u32,
    pub shared_ions: u16,
    pub total_ions: u16,
    pub precursor_mass: f32,
}

/// Registration record for one published batch; the merge phase uses it to
/// size the staged sections.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BatchMeta {
    pub batch_num: usize,
    pub num_specs: usize,
    pub file_index: usize,
}

/// One staging slot. `done == true` means the writer has drained it and
/// the producer may claim it; the flag is the ownership token.
pub struct SlotData {
    pub done: bool,
    pub batch_num: usize,
    pub packs: Vec<PartialHits>,
    pub samples: Vec<u16>,
    pub candidates: Vec<Candidate>,
    /// Sample-section length in bytes; already a byte count
    pub written: usize,
}

struct Slot {
    data: Mutex<SlotData>,
    freed: Condvar,
}

impl Slot {
    fn new() -> Self {
        Slot {
            data: Mutex::new(SlotData {
                done: true,
                batch_num: 0,
                packs: Vec::new(),
                samples: Vec::new(),
                candidates: Vec::new(),
                written: 0,
            }),
            freed: Condvar::new(),
        }
    }
}

/// Ring of [`NSTAGE`] staging slots plus the writer thread that persists
/// them in production order.
pub struct StageRing {
    slots: Arc<Vec<Slot>>,
    seq: usize,
    tx: Sender<()>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl StageRing {
    pub fn new(workspace: PathBuf, rank: usize) -> Result<Self> {
        std::fs::create_dir_all(&workspace)?;
        let slots: Arc<Vec<Slot>> = Arc::new((0..NSTAGE).map(|_| Slot::new()).collect());
        let (tx, rx) = bounded(NSTAGE * 2);

        let writer_slots = Arc::clone(&slots);
        let writer = std::thread::Builder::new()
            .name("hyperion-writer".into())
            .spawn(move || writer_loop(&writer_slots, &rx, &workspace, rank))
            .map_err(|_| EngineError::BadAlloc("staging writer thread"))?;

        Ok(StageRing {
            slots,
            seq: 0,
            tx,
            writer: Some(writer),
        })
    }

    /// Claim the next ring slot for `batch_num`, waiting until the writer
    /// has drained it. The returned guard is filled by the scoring kernel.
    pub fn begin_batch(&mut self, batch_num: usize) -> MutexGuard<'_, SlotData> {
        let slot = &self.slots[self.seq % NSTAGE];
        self.seq += 1;

        let mut data = slot.data.lock();
        while !data.done {
            slot.freed.wait(&mut data);
        }
        data.done = false;
        data.batch_num = batch_num;
        data.packs.clear();
        data.samples.clear();
        data.candidates.clear();
        data.written = 0;
        data
    }

    /// Wake the writer for the most recently filled slot.
    pub fn post(&self) -> Result<()> {
        self.tx
            .send(())
            .map_err(|_| EngineError::BadAlloc("staging writer channel"))
    }

    /// Send the terminal sentinel (a freed slot plus one post) and join
    /// the writer.
    pub fn finish(mut self) -> Result<()> {
        {
            let slot = &self.slots[self.seq % NSTAGE];
            let mut data = slot.data.lock();
            while !data.done {
                slot.freed.wait(&mut data);
            }
        }
        self.post()?;
        match self.writer.take().map(|w| w.join()) {
            Some(Ok(result)) => result,
            _ => Err(EngineError::BadAlloc("staging writer join")),
        }
    }
}

fn stage_path(workspace: &Path, batch_num: usize, rank: usize) -> PathBuf {
    workspace.join(format!("{}_{}.dat", batch_num, rank))
}

fn writer_loop(
    slots: &[Slot],
    rx: &Receiver<()>,
    workspace: &Path,
    rank: usize,
) -> Result<()> {
    let mut current = 0usize;
    while rx.recv().is_ok() {
        let slot = &slots[current % NSTAGE];
        current += 1;

        let mut data = slot.data.lock();
        if data.done {
            // Terminal sentinel
            break;
        }

        let path = stage_path(workspace, data.batch_num, rank);
        let mut wtr = BufWriter::new(File::create(path)?);
        for pack in &data.packs {
            wtr.write_u16::<LittleEndian>(pack.min)?;
            wtr.write_u16::<LittleEndian>(pack.max)?;
            wtr.write_u16::<LittleEndian>(pack.max2)?;
            wtr.write_u32::<LittleEndian>(pack.n)?;
            wtr.write_u32::<LittleEndian>(pack.query_id)?;
        }
        for &sample in &data.samples[..data.written / std::mem::size_of::<u16>()] {
            wtr.write_u16::<LittleEndian>(sample)?;
        }
        for cand in &data.candidates {
            wtr.write_f64::<LittleEndian>(cand.hyperscore)?;
            wtr.write_u32::<LittleEndian>(cand.peptide_len)?;
            wtr.write_u32::<LittleEndian>(cand.peptide)?;
            wtr.write_u16::<LittleEndian>(cand.shared_ions)?;
            wtr.write_u16::<LittleEndian>(cand.total_ions)?;
            wtr.write_f32::<LittleEndian>(cand.precursor_mass)?;
        }
        drop(wtr);

        data.done = true;
        slot.freed.notify_all();
    }
    Ok(())
}

/// Read one shard's staged batch back; `num_specs` comes from the batch
/// registration, not the file.
pub fn read_staged(
    workspace: &Path,
    batch_num: usize,
    rank: usize,
    num_specs: usize,
) -> Result<(Vec<PartialHits>, Vec<u16>, Vec<Candidate>)> {
    let path = stage_path(workspace, batch_num, rank);
    let mut rdr = BufReader::new(File::open(path)?);

    let mut packs = Vec::with_capacity(num_specs);
    for _ in 0..num_specs {
        packs.push(PartialHits {
            min: rdr.read_u16::<LittleEndian>()?,
            max: rdr.read_u16::<LittleEndian>()?,
            max2: rdr.read_u16::<LittleEndian>()?,
            n: rdr.read_u32::<LittleEndian>()?,
            query_id: rdr.read_u32::<LittleEndian>()?,
        });
    }
    let mut samples = vec![0u16; num_specs * SURVIVAL_SAMPLES];
    rdr.read_u16_into::<LittleEndian>(&mut samples)?;
    let mut candidates = Vec::with_capacity(num_specs);
    for _ in 0..num_specs {
        candidates.push(Candidate {
            hyperscore: rdr.read_f64::<LittleEndian>()?,
            peptide_len: rdr.read_u32::<LittleEndian>()?,
            peptide: rdr.read_u32::<LittleEndian>()?,
            shared_ions: rdr.read_u16::<LittleEndian>()?,
            total_ions: rdr.read_u16::<LittleEndian>()?,
            precursor_mass: rdr.read_f32::<LittleEndian>()?,
        });
    }
    Ok((packs, samples, candidates))
}

/// Post-loop merge across all shards: per spectrum, sum the staged
/// survival histograms, fold the distribution descriptors, re-run the
/// tail fit against the union, and report PSMs under `expect_max`.
///
/// Assumes every rank has finished staging (the transport collaborator
/// provides the barrier). Returns the number of PSMs reported.
pub fn merge_staged(
    workspace: &Path,
    nodes: usize,
    batches: &[BatchMeta],
    min_cpsm: u32,
    expect_max: f64,
    sink: &dyn OutputSink,
) -> Result<usize> {
    let mut fit = TailFit::new();
    let mut survival = vec![0u32; HISTOGRAM_SIZE];
    let mut reported = 0;

    let mut order: Vec<&BatchMeta> = batches.iter().collect();
    order.sort_by_key(|m| m.batch_num);

    for meta in order {
        let mut shards = Vec::with_capacity(nodes);
        for rank in 0..nodes {
            match read_staged(workspace, meta.batch_num, rank, meta.num_specs) {
                Ok(shard) => shards.push(shard),
                Err(e) => {
                    warn!(
                        "batch {} missing from rank {}: {}",
                        meta.batch_num, rank, e
                    );
                    return Err(e);
                }
            }
        }

        for q in 0..meta.num_specs {
            survival.fill(0);
            let mut merged = PartialHits::default();
            let mut best: Option<Candidate> = None;
            let mut best_max = 0u16;

            for (packs, samples, candidates) in &shards {
                let pack = packs[q];
                if pack.n == 0 {
                    merged.query_id = pack.query_id;
                    continue;
                }
                for (i, &v) in samples[q * SURVIVAL_SAMPLES..(q + 1) * SURVIVAL_SAMPLES]
                    .iter()
                    .enumerate()
                {
                    let idx = pack.min as usize + i;
                    if idx < HISTOGRAM_SIZE {
                        survival[idx] += v as u32;
                    }
                }

                if merged.n == 0 {
                    merged = pack;
                } else {
                    merged.min = merged.min.min(pack.min);
                    merged.max2 = merged.max2.max(pack.max2).min(merged.max.max(pack.max));
                    merged.max = merged.max.max(pack.max);
                    merged.n += pack.n;
                }
                if pack.max >= best_max {
                    best_max = pack.max;
                    best = Some(candidates[q]);
                }
            }

            if merged.n == 0 {
                continue;
            }
            let expect = fit.expect(&survival, merged.n, merged.max as usize, min_cpsm);
            if expect < expect_max {
                if let Some(top) = best {
                    sink.report(&Psm {
                        spectrum_id: merged.query_id as usize,
                        precursor_mass: top.precursor_mass,
                        peptide_len: top.peptide_len,
                        peptide: top.peptide,
                        hyperscore: top.hyperscore,
                        shared_ions: top.shared_ions,
                        total_ions: top.total_ions,
                        cpsms: merged.n,
                        expect,
                    })?;
                    reported += 1;
                }
            }
        }
    }
    Ok(reported)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::VecSink;

    fn stage_one(
        ring: &mut StageRing,
        batch_num: usize,
        packs: Vec<PartialHits>,
        samples: Vec<u16>,
        candidates: Vec<Candidate>,
    ) {
        let written = samples.len() * std::mem::size_of::<u16>();
        let mut slot = ring.begin_batch(batch_num);
        slot.packs = packs;
        slot.samples = samples;
        slot.candidates = candidates;
        slot.written = written;
    }

    fn sampled(survival: &[(usize, u16)], min: usize) -> Vec<u16> {
        let mut out = vec![0u16; SURVIVAL_SAMPLES];
        for &(idx, v) in survival {
            out[idx - min] = v;
        }
        out
    }

    #[test]
    fn staged_batches_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut ring = StageRing::new(dir.path().to_path_buf(), 0).unwrap();

        let pack = PartialHits {
            min: 3,
            max: 12,
            max2: 9,
            n: 5,
            query_id: 41,
        };
        let cand = Candidate {
            hyperscore: 1.25,
            peptide_len: 9,
            peptide: 77,
            shared_ions: 6,
            total_ions: 32,
            precursor_mass: 1001.5,
        };
        stage_one(
            &mut ring,
            2,
            vec![pack],
            sampled(&[(3, 2), (5, 2), (12, 1)], 3),
            vec![cand],
        );
        ring.post().unwrap();
        ring.finish().unwrap();

        let (packs, samples, candidates) = read_staged(dir.path(), 2, 0, 1).unwrap();
        assert_eq!(packs, vec![pack]);
        assert_eq!(samples[0], 2);
        assert_eq!(samples[2], 2);
        assert_eq!(samples[9], 1);
        assert_eq!(candidates, vec![cand]);
    }

    #[test]
    fn ring_slots_are_reused_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ring = StageRing::new(dir.path().to_path_buf(), 1).unwrap();

        // More batches than ring slots forces reuse behind the writer
        for batch in 0..(NSTAGE * 2) {
            stage_one(
                &mut ring,
                batch,
                vec![PartialHits {
                    min: 1,
                    max: 4,
                    max2: 2,
                    n: 1,
                    query_id: batch as u32,
                }],
                sampled(&[(1, 1)], 1),
                vec![Candidate::default()],
            );
            ring.post().unwrap();
        }
        ring.finish().unwrap();

        for batch in 0..(NSTAGE * 2) {
            let (packs, _, _) = read_staged(dir.path(), batch, 1, 1).unwrap();
            assert_eq!(packs[0].query_id, batch as u32);
        }
    }

    #[test]
    fn merge_sums_histograms_across_shards() {
        let dir = tempfile::tempdir().unwrap();

        // Two shards see the same spectrum: 3 candidates each, which is
        // below min_cpsm alone but enough once merged.
        for rank in 0..2 {
            let mut ring = StageRing::new(dir.path().to_path_buf(), rank).unwrap();
            let best = if rank == 0 { 10 } else { 12 };
            stage_one(
                &mut ring,
                0,
                vec![PartialHits {
                    min: 2,
                    max: best,
                    max2: 4,
                    n: 3,
                    query_id: 0,
                }],
                sampled(&[(2, 1), (4, 1), (best as usize, 1)], 2),
                vec![Candidate {
                    hyperscore: best as f64 / 10.0,
                    peptide_len: 9,
                    peptide: rank as u32 + 100,
                    shared_ions: 4,
                    total_ions: 32,
                    precursor_mass: 900.0,
                }],
            );
            ring.post().unwrap();
            ring.finish().unwrap();
        }

        let sink = VecSink::new();
        let batches = [BatchMeta {
            batch_num: 0,
            num_specs: 1,
            file_index: 0,
        }];
        let reported =
            merge_staged(dir.path(), 2, &batches, 4, f64::MAX, &sink).unwrap();

        assert_eq!(reported, 1);
        let psms = sink.psms();
        assert_eq!(psms[0].cpsms, 6);
        // The winning candidate comes from the shard with the higher max
        assert_eq!(psms[0].peptide, 101);
        assert!(psms[0].expect.is_finite());
    }

    #[test]
    fn merge_fails_on_missing_shard() {
        let dir = tempfile::tempdir().unwrap();
        let sink = VecSink::new();
        let batches = [BatchMeta {
            batch_num: 0,
            num_specs: 1,
            file_index: 0,
        }];
        assert!(merge_staged(dir.path(), 1, &batches, 1, 10.0, &sink).is_err());
    }
}
