//! Reader for the MS2 text format: `H` header lines, `S <scan> <scan> <m/z>`
//! opening each spectrum, optional `Z <charge> <M+H>` lines, then one
//! `<m/z> <intensity>` pair per peak.

use crate::error::{EngineError, Result};
use crate::mass::PROTON;
use crate::msquery::SpectrumSource;
use crate::spectrum::SpectrumBatch;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Scaling and acceptance applied while extracting query spectra.
#[derive(Copy, Clone, Debug)]
pub struct ExtractParams {
    pub scale: u32,
    pub min_mass: f32,
    pub max_mass: f32,
}

struct RawSpec {
    precursor_mass: f32,
    /// True once a Z line fixed the neutral mass
    charged: bool,
    peaks: Vec<(f32, f32)>,
}

struct BlockReader {
    reader: BufReader<File>,
    path: String,
    line_no: usize,
    current: Option<RawSpec>,
}

impl BlockReader {
    fn open(path: &Path) -> Result<Self> {
        Ok(BlockReader {
            reader: BufReader::new(File::open(path)?),
            path: path.display().to_string(),
            line_no: 0,
            current: None,
        })
    }

    fn malformed(&self, reason: &str) -> EngineError {
        EngineError::Malformed {
            path: self.path.clone(),
            line: self.line_no,
            reason: reason.into(),
        }
    }

    /// The next complete spectrum block, or `None` at end of file.
    fn next_block(&mut self) -> Result<Option<RawSpec>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(self.current.take());
            }
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('H') {
                continue;
            }

            match trimmed.as_bytes()[0] {
                b'S' => {
                    let mz = trimmed
                        .split_whitespace()
                        .nth(3)
                        .and_then(|v| v.parse::<f32>().ok())
                        .ok_or_else(|| self.malformed("bad S line"))?;
                    let finished = self.current.replace(RawSpec {
                        precursor_mass: mz,
                        charged: false,
                        peaks: Vec::new(),
                    });
                    if finished.is_some() {
                        return Ok(finished);
                    }
                }
                b'Z' => {
                    let mut fields = trimmed.split_whitespace().skip(1);
                    let _charge = fields
                        .next()
                        .and_then(|v| v.parse::<u8>().ok())
                        .ok_or_else(|| self.malformed("bad Z charge"))?;
                    let mh = fields
                        .next()
                        .and_then(|v| v.parse::<f32>().ok())
                        .ok_or_else(|| self.malformed("bad Z mass"))?;
                    if let Some(spec) = self.current.as_mut() {
                        // First Z line wins; the neutral mass is M+H less a proton
                        if !spec.charged {
                            spec.precursor_mass = mh - PROTON;
                            spec.charged = true;
                        }
                    }
                }
                b'I' | b'D' => {} // per-spectrum metadata, not consumed
                _ => {
                    let mut fields = trimmed.split_whitespace();
                    let mz = fields.next().and_then(|v| v.parse::<f32>().ok());
                    let intensity = fields.next().and_then(|v| v.parse::<f32>().ok());
                    match (self.current.as_mut(), mz, intensity) {
                        (Some(spec), Some(mz), Some(intensity)) => {
                            spec.peaks.push((mz, intensity));
                        }
                        _ => return Err(self.malformed("bad peak line")),
                    }
                }
            }
        }
    }
}

/// File-backed [`SpectrumSource`] over the MS2 format. Opening scans the
/// whole file once for the accepted-spectra and chunk counts; extraction
/// streams blocks on demand.
pub struct Ms2Reader {
    path: PathBuf,
    file_index: usize,
    params: ExtractParams,
    accepted: usize,
    chunks: usize,
    state: Option<BlockReader>,
}

impl Ms2Reader {
    pub fn open<P: AsRef<Path>>(
        path: P,
        file_index: usize,
        chunk_len: usize,
        params: ExtractParams,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut scan = BlockReader::open(&path)?;
        let mut accepted = 0;
        while let Some(spec) = scan.next_block()? {
            if accepts(&params, spec.precursor_mass) {
                accepted += 1;
            }
        }

        Ok(Ms2Reader {
            path,
            file_index,
            params,
            accepted,
            chunks: accepted.div_ceil(chunk_len),
            state: None,
        })
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }
}

fn accepts(params: &ExtractParams, mass: f32) -> bool {
    mass >= params.min_mass && mass <= params.max_mass
}

impl SpectrumSource for Ms2Reader {
    fn spectra_count(&self) -> usize {
        self.accepted
    }

    fn chunk_count(&self) -> usize {
        self.chunks
    }

    fn read_chunk(&mut self, limit: usize, batch: &mut SpectrumBatch) -> Result<usize> {
        if self.state.is_none() {
            self.state = Some(BlockReader::open(&self.path)?);
        }
        let reader = self.state.as_mut().unwrap();

        let scale = self.params.scale as f32;
        let mut added = 0;
        let mut peaks = Vec::new();
        while added < limit {
            let spec = match reader.next_block()? {
                Some(spec) => spec,
                None => break,
            };
            if !accepts(&self.params, spec.precursor_mass) {
                continue;
            }

            peaks.clear();
            for &(mz, intensity) in &spec.peaks {
                if mz <= 0.0 {
                    continue;
                }
                peaks.push(((mz * scale).round() as u32, intensity.round() as u32));
            }
            batch.push_spectrum(spec.precursor_mass, &peaks);
            added += 1;
        }
        Ok(added)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_ms2(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut fh = File::create(&path).unwrap();
        fh.write_all(body.as_bytes()).unwrap();
        path
    }

    const PARAMS: ExtractParams = ExtractParams {
        scale: 100,
        min_mass: 500.0,
        max_mass: 5000.0,
    };

    #[test]
    fn scan_counts_accepted_spectra() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ms2(
            &dir,
            "a.ms2",
            "H\tCreationDate 2024\n\
             S\t1\t1\t650.50\n100.0 10\n200.5 20\n\
             S\t2\t2\t120.0\n50.0 1\n\
             S\t3\t3\t501.25\nZ\t2\t1001.25\n300.0 5\n",
        );

        let reader = Ms2Reader::open(&path, 0, 10, PARAMS).unwrap();
        // The 120 Da spectrum falls outside the acceptance window
        assert_eq!(reader.spectra_count(), 2);
        assert_eq!(reader.chunk_count(), 1);
    }

    #[test]
    fn extraction_scales_and_skips_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ms2(
            &dir,
            "b.ms2",
            "S\t1\t1\t650.50\n100.0 10.4\n200.5 20\n\
             S\t2\t2\t120.0\n50.0 1\n\
             S\t3\t3\t501.25\nZ\t2\t1001.25\n300.0 5\n",
        );

        let mut reader = Ms2Reader::open(&path, 3, 10, PARAMS).unwrap();
        let mut batch = SpectrumBatch::new();
        let n = reader.read_chunk(10, &mut batch).unwrap();
        assert_eq!(n, 2);
        assert_eq!(batch.num_specs, 2);

        let q0 = batch.query(0);
        assert_eq!(q0.precursor_mass, 650.5);
        assert_eq!(q0.mz, &[10000, 20050]);
        assert_eq!(q0.intensity, &[10, 20]);

        // Z line overrides the S-line m/z with M+H minus a proton
        let q1 = batch.query(1);
        assert!((q1.precursor_mass - (1001.25 - PROTON)).abs() < 1e-3);
    }

    #[test]
    fn chunked_extraction_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::new();
        for scan in 0..7 {
            body.push_str(&format!("S\t{s}\t{s}\t800.0\n400.0 1\n", s = scan));
        }
        let path = write_ms2(&dir, "c.ms2", &body);

        let mut reader = Ms2Reader::open(&path, 0, 3, PARAMS).unwrap();
        assert_eq!(reader.chunk_count(), 3);

        let mut batch = SpectrumBatch::new();
        assert_eq!(reader.read_chunk(3, &mut batch).unwrap(), 3);
        batch.reset();
        assert_eq!(reader.read_chunk(3, &mut batch).unwrap(), 3);
        batch.reset();
        assert_eq!(reader.read_chunk(3, &mut batch).unwrap(), 1);
        batch.reset();
        assert_eq!(reader.read_chunk(3, &mut batch).unwrap(), 0);
    }

    #[test]
    fn malformed_peak_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ms2(&dir, "d.ms2", "S\t1\t1\t650.0\nnot-a-peak\n");
        let err = Ms2Reader::open(&path, 0, 10, PARAMS)
            .err()
            .expect("scan should fail");
        match err {
            EngineError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("expected malformed error, got {}", other),
        }
    }
}
