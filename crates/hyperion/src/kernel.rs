//! Batch-level scoring: fans a ready batch out over the compute team,
//! with per-thread scorecard and tail-fit scratch, then either reports
//! PSMs (shared-memory mode) or fills a staging slot (multi-shard mode).

use crate::config::SearchParameters;
use crate::error::{EngineError, Result};
use crate::exchange::{Candidate, PartialHits, SlotData};
use crate::expect::{bucket, TailFit, HISTOGRAM_SIZE, SURVIVAL_SAMPLES};
use crate::index::FragmentIndex;
use crate::scorecard::Scorecard;
use crate::scoring::{Hit, Scorer, SpectrumHits};
use crate::sink::{OutputSink, Psm};
use crate::spectrum::SpectrumBatch;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The scoring kernel behind a capability so the CPU and offload variants
/// are interchangeable at startup.
pub trait ScoringBackend: Sync {
    /// Score one ready batch. `base_spectrum_id` is the global id of the
    /// batch's first spectrum; `stage` selects multi-shard staging over
    /// direct reporting. Returns the number of PSMs reported.
    fn score_batch(
        &self,
        batch: &SpectrumBatch,
        base_spectrum_id: usize,
        threads: usize,
        stage: Option<&mut SlotData>,
    ) -> Result<usize>;
}

pub struct CpuBackend<'a> {
    pub index: &'a FragmentIndex,
    pub params: &'a SearchParameters,
    pub sink: Arc<dyn OutputSink>,
}

impl CpuBackend<'_> {
    fn scorer(&self) -> Scorer<'_> {
        Scorer {
            index: self.index,
            dm: self.params.dm,
            df: self.params.df,
            min_shp: self.params.min_shp,
        }
    }

    fn resolve(&self, hit: &Hit, spectrum_id: usize, cpsms: u32, expect: f64) -> Psm {
        let length = &self.index.lengths[hit.length_index as usize];
        Psm {
            spectrum_id,
            precursor_mass: hit.precursor_mass,
            peptide_len: length.peptide_len,
            peptide: length.entries[hit.peptide as usize].seq_id,
            hyperscore: hit.hyperscore,
            shared_ions: hit.shared_ions,
            total_ions: hit.total_ions,
            cpsms,
            expect,
        }
    }

    fn candidate(&self, hit: &Hit) -> Candidate {
        let length = &self.index.lengths[hit.length_index as usize];
        Candidate {
            hyperscore: hit.hyperscore,
            peptide_len: length.peptide_len,
            peptide: length.entries[hit.peptide as usize].seq_id,
            shared_ions: hit.shared_ions,
            total_ions: hit.total_ions,
            precursor_mass: hit.precursor_mass,
        }
    }
}

type Scratch = (Scorecard, SpectrumHits, TailFit);

impl ScoringBackend for CpuBackend<'_> {
    fn score_batch(
        &self,
        batch: &SpectrumBatch,
        base_spectrum_id: usize,
        threads: usize,
        stage: Option<&mut SlotData>,
    ) -> Result<usize> {
        let capacity = self.index.max_chunk_entries();
        if self.index.lengths.is_empty() || capacity == 0 {
            return Err(EngineError::InvalidMemory);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|_| EngineError::BadAlloc("compute thread pool"))?;

        let scorer = self.scorer();
        let top_matches = self.params.top_matches;
        let init = || -> Scratch {
            (
                Scorecard::new(capacity),
                SpectrumHits::new(top_matches),
                TailFit::new(),
            )
        };

        let counter = AtomicUsize::new(0);
        let start = Instant::now();
        let no_progress = self.params.no_progress;
        let progress = move |prev: usize| {
            if !no_progress && prev > 0 && prev % 10_000 == 0 {
                let duration = start.elapsed().as_millis() as usize;
                let rate = prev * 1000 / (duration + 1);
                log::trace!("- searched {} spectra ({} spectra/s)", prev, rate);
            }
        };

        match stage {
            None => {
                // Shared-memory mode: model the tail and report directly
                let psms: Vec<Option<Psm>> = pool.install(|| {
                    (0..batch.num_specs)
                        .into_par_iter()
                        .with_min_len(4)
                        .map_init(init, |(card, hits, fit), q| {
                            progress(counter.fetch_add(1, Ordering::Relaxed));
                            hits.reset();
                            scorer.score_spectrum(batch.query(q), card, hits);

                            if hits.cpsms < self.params.min_cpsm {
                                return None;
                            }
                            let top = *hits.top_k.max()?;
                            let expect = fit.expect(
                                &hits.survival,
                                hits.cpsms,
                                bucket(top.hyperscore),
                                self.params.min_cpsm,
                            );
                            if expect < self.params.expect_max {
                                Some(self.resolve(&top, base_spectrum_id + q, hits.cpsms, expect))
                            } else {
                                None
                            }
                        })
                        .collect()
                });

                let mut reported = 0;
                for psm in psms.into_iter().flatten() {
                    self.sink.report(&psm)?;
                    reported += 1;
                }
                Ok(reported)
            }
            Some(slot) => {
                // Multi-shard mode: emit distribution descriptors and the
                // local top candidate for the post-loop merge
                let rows: Vec<(PartialHits, [u16; SURVIVAL_SAMPLES], Candidate)> =
                    pool.install(|| {
                        (0..batch.num_specs)
                            .into_par_iter()
                            .with_min_len(4)
                            .map_init(init, |(card, hits, _), q| {
                                progress(counter.fetch_add(1, Ordering::Relaxed));
                                hits.reset();
                                scorer.score_spectrum(batch.query(q), card, hits);

                                let query_id = (base_spectrum_id + q) as u32;
                                match hits.top_k.max().copied() {
                                    Some(top) if hits.cpsms >= 1 => {
                                        let (min, max, max2) = hits.spread();
                                        let mut samples = [0u16; SURVIVAL_SAMPLES];
                                        for (i, sample) in samples.iter_mut().enumerate() {
                                            let idx = min as usize + i;
                                            if idx < HISTOGRAM_SIZE {
                                                *sample =
                                                    hits.survival[idx].min(u16::MAX as u32) as u16;
                                            }
                                        }
                                        (
                                            PartialHits {
                                                min,
                                                max,
                                                max2,
                                                n: hits.cpsms,
                                                query_id,
                                            },
                                            samples,
                                            self.candidate(&top),
                                        )
                                    }
                                    _ => (
                                        PartialHits {
                                            query_id,
                                            ..Default::default()
                                        },
                                        [0u16; SURVIVAL_SAMPLES],
                                        Candidate::default(),
                                    ),
                                }
                            })
                            .collect()
                    });

                for (pack, samples, candidate) in rows {
                    slot.packs.push(pack);
                    slot.samples.extend_from_slice(&samples);
                    slot.candidates.push(candidate);
                }
                slot.written =
                    batch.num_specs * SURVIVAL_SAMPLES * std::mem::size_of::<u16>();
                Ok(0)
            }
        }
    }
}
