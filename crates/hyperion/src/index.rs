use crate::error::{EngineError, Result};
use crate::mass::spectrum_slots;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// One peptide in a mass-sorted table.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PeptideEntry {
    pub mass: f32,
    pub seq_id: u32,
}

/// Compressed-sparse-row inverted index over scaled m/z bins for one
/// internal chunk of peptides.
///
/// `bins[b]..bins[b + 1]` bounds the ion records whose fragment m/z falls
/// in bin `b`; `ions` holds packed records `peptide_id * speclen + slot`,
/// sorted within each bin.
#[derive(Clone, Debug, Default)]
pub struct IonChunk {
    pub bins: Vec<u32>,
    pub ions: Vec<u32>,
}

/// All peptides of a single length, with their ion chunks.
#[derive(Clone, Debug, Default)]
pub struct LengthIndex {
    pub peptide_len: u32,
    /// Sorted by monoisotopic mass, ascending
    pub entries: Vec<PeptideEntry>,
    pub chunks: Vec<IonChunk>,
    pub chunk_size: u32,
    pub last_chunk_size: u32,
}

impl LengthIndex {
    pub fn spectrum_len(&self, maxz: u32) -> u32 {
        spectrum_slots(self.peptide_len, maxz)
    }
}

/// Read-only fragment-ion index, immutable for the duration of a search.
#[derive(Clone, Debug, Default)]
pub struct FragmentIndex {
    /// m/z scaling factor baked into the bins
    pub scale: u32,
    pub maxz: u32,
    /// Largest scaled m/z representable; `bins` arrays have `max_mz + 2` slots
    pub max_mz: u32,
    pub lengths: Vec<LengthIndex>,
}

impl FragmentIndex {
    /// Largest peptide table across length chunks; sizes the scorecards.
    pub fn max_chunk_entries(&self) -> usize {
        self.lengths
            .iter()
            .map(|l| l.entries.len())
            .max()
            .unwrap_or(0)
    }

    pub fn num_peptides(&self) -> usize {
        self.lengths.iter().map(|l| l.entries.len()).sum()
    }

    pub fn num_ions(&self) -> usize {
        self.lengths
            .iter()
            .flat_map(|l| l.chunks.iter())
            .map(|c| c.ions.len())
            .sum()
    }
}

/// Solve the `[minlimit, maxlimit]` window over a mass-sorted peptide table
/// such that every entry with `pmass - dm <= mass <= pmass + dm` is inside
/// it. Returns `(minlimit, maxlimit, found)`; `found` is true iff the
/// window endpoints bracket the query window. A negative `dm` disables the
/// filter and returns the full table with `found == false`.
pub fn precursor_window(entries: &[PeptideEntry], pmass: f32, dm: f32) -> (usize, usize, bool) {
    if entries.is_empty() {
        return (0, 0, false);
    }

    let max = entries.len() - 1;
    if dm < 0.0 {
        return (0, max, false);
    }

    let pmass1 = pmass - dm;
    let pmass2 = pmass + dm;

    let minlimit = if pmass1 < entries[0].mass {
        0
    } else if pmass1 > entries[max].mass {
        return (max, max, false);
    } else {
        find_min(entries, pmass1, 0, max)
    };

    let maxlimit = if pmass2 > entries[max].mass {
        max
    } else if pmass2 < entries[0].mass {
        return (0, 0, false);
    } else {
        find_max(entries, pmass2, 0, max)
    };

    let found = entries[maxlimit].mass <= pmass2 && entries[minlimit].mass >= pmass1;
    (minlimit, maxlimit, found)
}

/// Window below which the bounded recursion finishes linearly.
const LINEAR_WINDOW: usize = 20;

fn find_min(entries: &[PeptideEntry], pmass1: f32, min: usize, max: usize) -> usize {
    if max - min < LINEAR_WINDOW {
        let mut current = min;
        while current < max && entries[current].mass < pmass1 {
            current += 1;
        }
        return current;
    }

    let half = (min + max) / 2;
    if pmass1 > entries[half].mass {
        find_min(entries, pmass1, half, max)
    } else if pmass1 < entries[half].mass {
        find_min(entries, pmass1, min, half)
    } else {
        // Walk left over the run of equal masses
        let mut half = half;
        while half > 0 && entries[half - 1].mass == pmass1 {
            half -= 1;
        }
        half
    }
}

fn find_max(entries: &[PeptideEntry], pmass2: f32, min: usize, max: usize) -> usize {
    if max - min < LINEAR_WINDOW {
        let mut current = max;
        while current > min && entries[current].mass > pmass2 {
            current -= 1;
        }
        return current;
    }

    let half = (min + max) / 2;
    if pmass2 > entries[half].mass {
        find_max(entries, pmass2, half, max)
    } else if pmass2 < entries[half].mass {
        find_max(entries, pmass2, min, half)
    } else {
        // Walk right over the run of equal masses
        let mut half = half;
        while half + 1 < entries.len() && entries[half + 1].mass == pmass2 {
            half += 1;
        }
        half
    }
}

const MAGIC: &[u8; 4] = b"HXI1";

/// Load an index produced by the builder. Little-endian throughout.
pub fn read_index<P: AsRef<Path>>(path: P) -> Result<FragmentIndex> {
    let mut rdr = BufReader::new(File::open(path.as_ref())?);

    let mut magic = [0u8; 4];
    rdr.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(EngineError::Config(format!(
            "`{}` is not a fragment index",
            path.as_ref().display()
        )));
    }

    let scale = rdr.read_u32::<LittleEndian>()?;
    let maxz = rdr.read_u32::<LittleEndian>()?;
    let max_mz = rdr.read_u32::<LittleEndian>()?;
    let n_lengths = rdr.read_u32::<LittleEndian>()? as usize;

    let mut lengths = Vec::with_capacity(n_lengths);
    for _ in 0..n_lengths {
        let peptide_len = rdr.read_u32::<LittleEndian>()?;
        let n_entries = rdr.read_u32::<LittleEndian>()? as usize;
        let mut entries = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            let mass = rdr.read_f32::<LittleEndian>()?;
            let seq_id = rdr.read_u32::<LittleEndian>()?;
            entries.push(PeptideEntry { mass, seq_id });
        }

        let chunk_size = rdr.read_u32::<LittleEndian>()?;
        let last_chunk_size = rdr.read_u32::<LittleEndian>()?;
        let n_chunks = rdr.read_u32::<LittleEndian>()? as usize;
        let mut chunks = Vec::with_capacity(n_chunks);
        for _ in 0..n_chunks {
            let n_bins = rdr.read_u32::<LittleEndian>()? as usize;
            let mut bins = vec![0u32; n_bins];
            rdr.read_u32_into::<LittleEndian>(&mut bins)?;
            let n_ions = rdr.read_u32::<LittleEndian>()? as usize;
            let mut ions = vec![0u32; n_ions];
            rdr.read_u32_into::<LittleEndian>(&mut ions)?;
            chunks.push(IonChunk { bins, ions });
        }

        lengths.push(LengthIndex {
            peptide_len,
            entries,
            chunks,
            chunk_size,
            last_chunk_size,
        });
    }

    Ok(FragmentIndex {
        scale,
        maxz,
        max_mz,
        lengths,
    })
}

/// Serialize an index in the format [`read_index`] consumes.
pub fn write_index<P: AsRef<Path>>(index: &FragmentIndex, path: P) -> Result<()> {
    let mut wtr = BufWriter::new(File::create(path.as_ref())?);

    wtr.write_all(MAGIC)?;
    wtr.write_u32::<LittleEndian>(index.scale)?;
    wtr.write_u32::<LittleEndian>(index.maxz)?;
    wtr.write_u32::<LittleEndian>(index.max_mz)?;
    wtr.write_u32::<LittleEndian>(index.lengths.len() as u32)?;

    for length in &index.lengths {
        wtr.write_u32::<LittleEndian>(length.peptide_len)?;
        wtr.write_u32::<LittleEndian>(length.entries.len() as u32)?;
        for entry in &length.entries {
            wtr.write_f32::<LittleEndian>(entry.mass)?;
            wtr.write_u32::<LittleEndian>(entry.seq_id)?;
        }
        wtr.write_u32::<LittleEndian>(length.chunk_size)?;
        wtr.write_u32::<LittleEndian>(length.last_chunk_size)?;
        wtr.write_u32::<LittleEndian>(length.chunks.len() as u32)?;
        for chunk in &length.chunks {
            wtr.write_u32::<LittleEndian>(chunk.bins.len() as u32)?;
            for &b in &chunk.bins {
                wtr.write_u32::<LittleEndian>(b)?;
            }
            wtr.write_u32::<LittleEndian>(chunk.ions.len() as u32)?;
            for &ion in &chunk.ions {
                wtr.write_u32::<LittleEndian>(ion)?;
            }
        }
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn entries(masses: &[f32]) -> Vec<PeptideEntry> {
        masses
            .iter()
            .enumerate()
            .map(|(i, &mass)| PeptideEntry {
                mass,
                seq_id: i as u32,
            })
            .collect()
    }

    #[test]
    fn window_single_entry_hit() {
        let e = entries(&[500.0, 1000.0, 1500.0]);
        let (lo, hi, found) = precursor_window(&e, 1000.0, 5.0);
        assert_eq!((lo, hi), (1, 1));
        assert!(found);
    }

    #[test]
    fn window_wide_tolerance_still_tight() {
        let e = entries(&[500.0, 1000.0, 1500.0]);
        let (lo, hi, found) = precursor_window(&e, 999.999, 10.0);
        assert_eq!((lo, hi), (1, 1));
        assert!(found);
    }

    #[test]
    fn window_negative_dm_full_range() {
        let e = entries(&[500.0, 1000.0, 1500.0]);
        let (lo, hi, found) = precursor_window(&e, 1000.0, -1.0);
        assert_eq!((lo, hi), (0, 2));
        assert!(!found);
    }

    #[test]
    fn window_below_smallest() {
        let e = entries(&[500.0, 1000.0, 1500.0]);
        let (lo, hi, found) = precursor_window(&e, 100.0, 5.0);
        assert_eq!((lo, hi), (0, 0));
        assert!(!found);
    }

    #[test]
    fn window_above_largest() {
        let e = entries(&[500.0, 1000.0, 1500.0]);
        let (lo, hi, found) = precursor_window(&e, 2000.0, 5.0);
        assert_eq!((lo, hi), (2, 2));
        assert!(!found);
    }

    #[test]
    fn window_is_exact_over_long_tables() {
        // Force the recursive path (> LINEAR_WINDOW entries) and compare
        // against a brute-force scan, including runs of duplicate masses.
        let mut masses = Vec::new();
        for i in 0..200 {
            masses.push(400.0 + (i / 3) as f32 * 2.5);
        }
        let e = entries(&masses);

        for pmass in [400.0, 455.5, 512.0, 561.25, 400.0 + 66.0 * 2.5] {
            for dm in [0.0, 1.0, 2.5, 7.5, 100.0] {
                let (lo, hi, found) = precursor_window(&e, pmass, dm);
                let inside: Vec<usize> = (0..e.len())
                    .filter(|&i| e[i].mass >= pmass - dm && e[i].mass <= pmass + dm)
                    .collect();
                if let (Some(&first), Some(&last)) = (inside.first(), inside.last()) {
                    assert_eq!((lo, hi), (first, last), "pmass={} dm={}", pmass, dm);
                    assert!(found);
                } else {
                    // Empty window: the caller skips on hi < lo or !found
                    assert!(hi < lo || !found, "pmass={} dm={}", pmass, dm);
                }
            }
        }
    }

    #[test]
    fn index_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.hxi");

        let index = FragmentIndex {
            scale: 100,
            maxz: 2,
            max_mz: 5000,
            lengths: vec![LengthIndex {
                peptide_len: 8,
                entries: entries(&[512.5, 930.25, 1422.0]),
                chunks: vec![IonChunk {
                    bins: vec![0, 0, 2, 2, 3],
                    ions: vec![7, 19, 42],
                }],
                chunk_size: 3,
                last_chunk_size: 3,
            }],
        };

        write_index(&index, &path).unwrap();
        let loaded = read_index(&path).unwrap();

        assert_eq!(loaded.scale, 100);
        assert_eq!(loaded.lengths.len(), 1);
        assert_eq!(loaded.lengths[0].entries, index.lengths[0].entries);
        assert_eq!(loaded.lengths[0].chunks[0].bins, vec![0, 0, 2, 2, 3]);
        assert_eq!(loaded.lengths[0].chunks[0].ions, vec![7, 19, 42]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-index");
        std::fs::write(&path, b"MZML....").unwrap();
        assert!(read_index(&path).is_err());
    }
}
