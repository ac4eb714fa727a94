use crate::expect::{bucket, HISTOGRAM_SIZE, MAX_HYPERSCORE};
use crate::index::{precursor_window, FragmentIndex};
use crate::scorecard::Scorecard;
use crate::spectrum::QueryView;
use crate::topk::BoundedHeap;

/// A candidate peptide-spectrum match, immutable once in the heap.
#[derive(Copy, Clone, Debug, Default)]
pub struct Hit {
    pub hyperscore: f64,
    /// Peptide-length chunk the candidate came from
    pub length_index: u16,
    /// Offset into that chunk's peptide table
    pub peptide: u32,
    pub shared_ions: u16,
    pub total_ions: u16,
    pub precursor_mass: f32,
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        self.hyperscore.total_cmp(&other.hyperscore) == std::cmp::Ordering::Equal
    }
}

impl Eq for Hit {}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hyperscore.total_cmp(&other.hyperscore)
    }
}

/// Per-spectrum scoring state, owned by one compute thread and reset
/// between spectra.
pub struct SpectrumHits {
    pub top_k: BoundedHeap<Hit>,
    /// Histogram of `round(hyperscore * 10)` over candidates that passed
    /// the shared-peak filter
    pub survival: Vec<u32>,
    pub cpsms: u32,
}

impl SpectrumHits {
    pub fn new(top_matches: usize) -> Self {
        SpectrumHits {
            top_k: BoundedHeap::new(top_matches),
            survival: vec![0; HISTOGRAM_SIZE],
            cpsms: 0,
        }
    }

    pub fn record(&mut self, hit: Hit) {
        self.survival[bucket(hit.hyperscore)] += 1;
        self.cpsms += 1;
        self.top_k.insert(hit);
    }

    pub fn reset(&mut self) {
        self.top_k.clear();
        self.survival.fill(0);
        self.cpsms = 0;
    }

    /// Smallest populated bucket, the scaled top score, and the runner-up
    /// bucket; the per-spectrum distribution descriptor for the exchange.
    pub fn spread(&self) -> (u16, u16, u16) {
        let max = self
            .survival
            .iter()
            .rposition(|&v| v >= 1)
            .unwrap_or(0);
        let min = self.survival.iter().position(|&v| v >= 1).unwrap_or(0);
        let next = if self.survival[max] >= 2 {
            max
        } else {
            self.survival[..max]
                .iter()
                .rposition(|&v| v >= 1)
                .unwrap_or(max)
        };
        (min as u16, max as u16, next as u16)
    }
}

fn factorial(n: u16) -> f64 {
    (1..=n as u64).fold(1.0, |acc, v| acc * v as f64)
}

/// X!Tandem-style hyperscore over matched b/y counts and their summed
/// intensities. Non-positive when either series is unmatched.
pub fn hyperscore(bc: u16, yc: u16, ibc: u64, iyc: u64) -> f64 {
    let pp = factorial(bc) * factorial(yc);
    let score = (0.001 + pp * ibc as f64 * iyc as f64).log10() - 6.0;
    if score.is_finite() {
        score
    } else {
        MAX_HYPERSCORE
    }
}

/// The fragment-ion matcher: sweeps each query peak over the inverted
/// index, accumulates per-peptide b/y evidence in the scorecard, extracts
/// candidates, and clears only the touched slice.
pub struct Scorer<'i> {
    pub index: &'i FragmentIndex,
    pub dm: f32,
    pub df: u32,
    pub min_shp: u16,
}

impl Scorer<'_> {
    pub fn score_spectrum(&self, query: QueryView<'_>, card: &mut Scorecard, hits: &mut SpectrumHits) {
        let max_mz = self.index.max_mz;
        let df = self.df;

        for (ixx, length) in self.index.lengths.iter().enumerate() {
            if length.entries.is_empty() {
                continue;
            }
            let speclen = length.spectrum_len(self.index.maxz);
            let half = speclen / 2;

            for chunk in &length.chunks {
                let (minlimit, maxlimit, found) =
                    precursor_window(&length.entries, query.precursor_mass, self.dm);
                if !found || maxlimit < minlimit {
                    continue;
                }

                // Sweep every peak over its tolerance window of bins,
                // narrowing each bin to the peptide window by ion key
                let lo_key = minlimit as u32 * speclen;
                let hi_key = (maxlimit as u32 + 1) * speclen - 1;
                for (k, &qion) in query.mz.iter().enumerate() {
                    if qion > df && qion < max_mz.saturating_sub(1 + df) {
                        let intensity = query.intensity[k];
                        for bin in (qion - df)..=(qion + df) {
                            let start = chunk.bins[bin as usize] as usize;
                            let end = chunk.bins[bin as usize + 1] as usize;
                            if end <= start {
                                continue;
                            }

                            let slice = &chunk.ions[start..end];
                            let lo = slice.partition_point(|&r| r < lo_key);
                            let hi = slice.partition_point(|&r| r <= hi_key);
                            for &raw in &slice[lo..hi] {
                                let peptide = (raw / speclen) as usize;
                                if raw % speclen < half {
                                    card.hit_b(peptide, intensity);
                                } else {
                                    card.hit_y(peptide, intensity);
                                }
                            }
                        }
                    }
                }

                for it in minlimit..=maxlimit {
                    let bcc = card.bc[it];
                    let ycc = card.yc[it];
                    let shared = bcc as u32 + ycc as u32;
                    if shared >= self.min_shp as u32 {
                        let score = hyperscore(bcc, ycc, card.ibc[it], card.iyc[it]);
                        // Non-positive means one series went unmatched
                        if score > 0.0 {
                            hits.record(Hit {
                                hyperscore: score,
                                length_index: ixx as u16,
                                peptide: it as u32,
                                shared_ions: shared as u16,
                                total_ions: speclen as u16,
                                precursor_mass: query.precursor_mass,
                            });
                        }
                    }
                }

                card.clear_slice(minlimit, maxlimit);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::{IonChunk, LengthIndex, PeptideEntry};
    use crate::spectrum::SpectrumBatch;

    /// Assemble a one-length-chunk index from per-peptide ion lists of
    /// (scaled m/z bin, ion slot) pairs.
    fn mk_index(
        peptide_len: u32,
        maxz: u32,
        max_mz: u32,
        masses: &[f32],
        ions: &[&[(u32, u32)]],
    ) -> FragmentIndex {
        let speclen = (peptide_len - 1) * maxz * 2;
        let mut records: Vec<(u32, u32)> = Vec::new();
        for (pid, list) in ions.iter().enumerate() {
            for &(bin, slot) in list.iter() {
                assert!(slot < speclen);
                records.push((bin, pid as u32 * speclen + slot));
            }
        }
        records.sort_unstable();

        let mut bins = vec![0u32; max_mz as usize + 2];
        for &(bin, _) in &records {
            bins[bin as usize + 1] += 1;
        }
        for b in 1..bins.len() {
            bins[b] += bins[b - 1];
        }
        let ions = records.into_iter().map(|(_, raw)| raw).collect();

        FragmentIndex {
            scale: 100,
            maxz,
            max_mz,
            lengths: vec![LengthIndex {
                peptide_len,
                entries: masses
                    .iter()
                    .enumerate()
                    .map(|(i, &mass)| PeptideEntry {
                        mass,
                        seq_id: i as u32,
                    })
                    .collect(),
                chunks: vec![IonChunk { bins, ions }],
                chunk_size: masses.len() as u32,
                last_chunk_size: masses.len() as u32,
            }],
        }
    }

    fn query_batch(pmass: f32, peaks: &[(u32, u32)]) -> SpectrumBatch {
        let mut batch = SpectrumBatch::new();
        batch.push_spectrum(pmass, peaks);
        batch
    }

    #[test]
    fn matched_series_produce_a_candidate() {
        // One 9-mer, speclen 32: b slots [0, 16), y slots [16, 32)
        let index = mk_index(
            9,
            2,
            5000,
            &[1000.0],
            &[&[(100, 0), (200, 1), (300, 16), (400, 17)]],
        );
        let scorer = Scorer {
            index: &index,
            dm: 5.0,
            df: 0,
            min_shp: 4,
        };

        let batch = query_batch(1000.0, &[(100, 1000), (200, 1000), (300, 1000), (400, 1000)]);
        let mut card = Scorecard::new(index.max_chunk_entries());
        let mut hits = SpectrumHits::new(10);

        scorer.score_spectrum(batch.query(0), &mut card, &mut hits);

        assert_eq!(hits.cpsms, 1);
        let best = hits.top_k.max().unwrap();
        // 2 b + 2 y at intensity 1000: log10(0.001 + 4 * 2000 * 2000) - 6
        let expected = (0.001 + 4.0 * 2000.0 * 2000.0_f64).log10() - 6.0;
        assert!((best.hyperscore - expected).abs() < 1e-12);
        assert_eq!(best.shared_ions, 4);
        assert_eq!(best.total_ions, 32);
        assert_eq!(hits.survival.iter().sum::<u32>(), hits.cpsms);

        // The touched scorecard slice was cleared after the chunk
        assert!(card.bc.iter().all(|&v| v == 0));
        assert!(card.ibc.iter().all(|&v| v == 0));
    }

    #[test]
    fn single_series_match_is_rejected() {
        // Only b-ions match: hyperscore stays non-positive
        let index = mk_index(9, 2, 5000, &[1000.0], &[&[(100, 0), (200, 1), (300, 2), (400, 3)]]);
        let scorer = Scorer {
            index: &index,
            dm: 5.0,
            df: 0,
            min_shp: 4,
        };

        let batch = query_batch(1000.0, &[(100, 1000), (200, 1000), (300, 1000), (400, 1000)]);
        let mut card = Scorecard::new(1);
        let mut hits = SpectrumHits::new(10);
        scorer.score_spectrum(batch.query(0), &mut card, &mut hits);
        assert_eq!(hits.cpsms, 0);
    }

    #[test]
    fn precursor_window_gates_scoring() {
        let index = mk_index(9, 2, 5000, &[1000.0], &[&[(100, 0), (300, 16)]]);
        let scorer = Scorer {
            index: &index,
            dm: 5.0,
            df: 0,
            min_shp: 1,
        };

        // Precursor 200 Da away from the only peptide
        let batch = query_batch(1200.0, &[(100, 1000), (300, 1000)]);
        let mut card = Scorecard::new(1);
        let mut hits = SpectrumHits::new(10);
        scorer.score_spectrum(batch.query(0), &mut card, &mut hits);
        assert_eq!(hits.cpsms, 0);
    }

    #[test]
    fn boundary_peak_is_skipped() {
        // A peak at exactly max_mz * scale is outside the open interval
        let max_mz = 5000;
        let index = mk_index(9, 2, max_mz, &[1000.0], &[&[(4999, 0), (100, 16)]]);
        let scorer = Scorer {
            index: &index,
            dm: 5.0,
            df: 0,
            min_shp: 1,
        };

        let batch = query_batch(1000.0, &[(max_mz, 1000), (100, 1000)]);
        let mut card = Scorecard::new(1);
        let mut hits = SpectrumHits::new(10);
        scorer.score_spectrum(batch.query(0), &mut card, &mut hits);

        // Only the y-ion at bin 100 can match; single series, no candidate
        assert_eq!(hits.cpsms, 0);
    }

    #[test]
    fn fragment_tolerance_spans_adjacent_bins() {
        let index = mk_index(9, 2, 5000, &[1000.0], &[&[(101, 0), (299, 16)]]);
        let scorer = Scorer {
            index: &index,
            dm: 5.0,
            df: 1,
            min_shp: 2,
        };

        let batch = query_batch(1000.0, &[(100, 1000), (300, 1000)]);
        let mut card = Scorecard::new(1);
        let mut hits = SpectrumHits::new(10);
        scorer.score_spectrum(batch.query(0), &mut card, &mut hits);
        assert_eq!(hits.cpsms, 1);
    }

    #[test]
    fn top_k_keeps_the_largest_and_survival_buckets_fill() {
        let mut hits = SpectrumHits::new(2);
        for h in [0.5, 1.2, 2.7, 3.9] {
            hits.record(Hit {
                hyperscore: h,
                ..Default::default()
            });
        }

        assert_eq!(hits.cpsms, 4);
        for idx in [5, 12, 27, 39] {
            assert_eq!(hits.survival[idx], 1);
        }
        assert_eq!(hits.survival.iter().sum::<u32>(), 4);

        let kept = hits.top_k.into_sorted_desc();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].hyperscore, 3.9);
        assert_eq!(kept[1].hyperscore, 2.7);
    }

    #[test]
    fn spread_describes_the_distribution() {
        let mut hits = SpectrumHits::new(4);
        for h in [0.5, 1.2, 2.7, 3.9] {
            hits.record(Hit {
                hyperscore: h,
                ..Default::default()
            });
        }
        let (min, max, next) = hits.spread();
        assert_eq!((min, max, next), (5, 39, 27));

        // Duplicate top score: the runner-up shares the max bucket
        hits.record(Hit {
            hyperscore: 3.9,
            ..Default::default()
        });
        assert_eq!(hits.spread(), (5, 39, 39));
    }

    #[test]
    fn scoring_is_deterministic() {
        let index = mk_index(
            9,
            2,
            5000,
            &[998.0, 1000.0, 1002.0],
            &[
                &[(100, 0), (300, 16)],
                &[(100, 1), (200, 2), (300, 17), (400, 18)],
                &[(200, 3), (400, 19)],
            ],
        );
        let scorer = Scorer {
            index: &index,
            dm: 5.0,
            df: 0,
            min_shp: 2,
        };
        let batch = query_batch(1000.0, &[(100, 500), (200, 700), (300, 900), (400, 1100)]);

        let run = || {
            let mut card = Scorecard::new(index.max_chunk_entries());
            let mut hits = SpectrumHits::new(5);
            scorer.score_spectrum(batch.query(0), &mut card, &mut hits);
            let survival = hits.survival.clone();
            let cpsms = hits.cpsms;
            let top: Vec<(u32, u64)> = hits
                .top_k
                .into_sorted_desc()
                .into_iter()
                .map(|h| (h.peptide, h.hyperscore.to_bits()))
                .collect();
            (survival, cpsms, top)
        };

        assert_eq!(run(), run());
    }
}
