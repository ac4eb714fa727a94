use crate::error::{EngineError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// How the index builder distributes peptide entries across ranks. The
/// search core reads whatever shard it is handed; this is recorded so it
/// can be echoed into the results manifest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistPolicy {
    Cyclic,
    Chunk,
    Zigzag,
}

impl Default for DistPolicy {
    fn default() -> Self {
        DistPolicy::Cyclic
    }
}

/// A variable post-translational modification, parsed from `AA:MASS:NUM`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub residues: String,
    pub mass: f32,
    pub limit: u8,
}

impl FromStr for Modification {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let residues = parts
            .next()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| EngineError::Config(format!("bad mod spec `{}`", s)))?
            .to_string();
        let mass = parts
            .next()
            .and_then(|m| m.parse::<f32>().ok())
            .ok_or_else(|| EngineError::Config(format!("bad mod mass in `{}`", s)))?;
        let limit = parts
            .next()
            .and_then(|n| n.parse::<u8>().ok())
            .ok_or_else(|| EngineError::Config(format!("bad mod count in `{}`", s)))?;
        Ok(Modification {
            residues,
            mass,
            limit,
        })
    }
}

#[derive(Deserialize, Default)]
/// Search options deserialized from a JSON parameter file. Every field is
/// optional; [`Builder::build`] fills defaults and clamps out-of-range
/// values rather than rejecting them.
pub struct Builder {
    /// Location of the pre-built fragment-ion index
    pub dbpath: Option<String>,
    /// MS2 query files to search
    pub dataset: Option<Vec<String>>,
    /// Output (and staging) directory
    pub workspace: Option<String>,
    /// Max concurrent compute threads per instance
    pub threads: Option<usize>,
    /// Max concurrent I/O threads
    pub prepthreads: Option<usize>,
    /// Max simultaneous GPU offload streams
    pub gputhreads: Option<usize>,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    /// Max fragment charge considered by the index
    pub maxz: Option<u32>,
    /// m/z bin width in Da; scale = round(1/res)
    pub res: Option<f32>,
    /// Precursor mass window half-width in Da. Negative disables the
    /// precursor filter (full-range search).
    #[serde(rename = "dM")]
    pub dm: Option<f32>,
    /// Fragment bin tolerance in Da (scaled to bins internally)
    #[serde(rename = "dF")]
    pub df: Option<f32>,
    pub min_mass: Option<f32>,
    pub max_mass: Option<f32>,
    /// Minimum shared b+y ions for candidacy
    pub min_shp: Option<u16>,
    /// Minimum candidates to attempt the tail fit
    pub min_cpsm: Option<u32>,
    pub topmatches: Option<usize>,
    pub expect_max: Option<f64>,
    /// Scratch memory budget in MB
    pub spadmem: Option<usize>,
    pub policy: Option<DistPolicy>,
    /// Variable PTMs as `AA:MASS:NUM` strings
    pub mods: Option<Vec<String>>,
    pub nogpuindex: Option<bool>,
    pub reindex: Option<bool>,
    pub nocache: Option<bool>,
    pub matchcharge: Option<bool>,
    pub noprogress: Option<bool>,
    pub verbose: Option<bool>,
    /// Number of cooperating instances (shards)
    pub nodes: Option<usize>,
    /// This instance's rank in [0, nodes)
    pub rank: Option<usize>,
}

/// Finalized search parameters; the single source of truth threaded through
/// every stage of the pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct SearchParameters {
    pub index_path: PathBuf,
    pub query_paths: Vec<String>,
    pub workspace: PathBuf,
    pub threads: usize,
    pub prep_threads: usize,
    pub gpu_threads: usize,
    pub min_len: usize,
    pub max_len: usize,
    pub maxz: u32,
    /// round(1/res); m/z values are stored as `mz * scale` integer bins
    pub scale: u32,
    pub dm: f32,
    /// Fragment tolerance in scaled bins
    pub df: u32,
    pub min_mass: f32,
    pub max_mass: f32,
    pub min_shp: u16,
    pub min_cpsm: u32,
    pub top_matches: usize,
    pub expect_max: f64,
    pub scratch_mb: usize,
    pub policy: DistPolicy,
    pub mods: Vec<Modification>,
    pub no_gpu_index: bool,
    pub reindex: bool,
    pub no_cache: bool,
    pub match_charge: bool,
    pub no_progress: bool,
    pub verbose: bool,
    pub nodes: usize,
    pub rank: usize,
}

/// Most variable modifications allowed on a single residue class.
const MAX_MOD_COUNT: u8 = 8;

impl Builder {
    pub fn build(self) -> Result<SearchParameters> {
        let threads = self
            .threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1);

        let mut res = self.res.unwrap_or(0.01);
        if !(0.01..=5.0).contains(&res) {
            warn!("res {} out of range, clamping to [0.01, 5.0]", res);
            res = res.clamp(0.01, 5.0);
        }
        let scale = ((1.0 / res).round() as u32).max(1);

        let df_da = self.df.unwrap_or(0.02).abs();
        let df = (df_da * scale as f32).round() as u32;

        let min_len = self.min_len.unwrap_or(6).max(2);
        let max_len = self.max_len.unwrap_or(40).max(min_len);

        let mods = self
            .mods
            .unwrap_or_default()
            .iter()
            .map(|m| m.parse::<Modification>())
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|mut m| {
                if m.limit > MAX_MOD_COUNT {
                    warn!(
                        "mod {} allows {} sites, clamping to {}",
                        m.residues, m.limit, MAX_MOD_COUNT
                    );
                    m.limit = MAX_MOD_COUNT;
                }
                m
            })
            .collect();

        let nodes = self.nodes.unwrap_or(1).max(1);
        let rank = self.rank.unwrap_or(0);
        if rank >= nodes {
            return Err(EngineError::Config(format!(
                "rank {} out of range for {} nodes",
                rank, nodes
            )));
        }

        Ok(SearchParameters {
            index_path: self.dbpath.unwrap_or_default().into(),
            query_paths: self.dataset.unwrap_or_default(),
            workspace: self.workspace.unwrap_or_else(|| ".".into()).into(),
            threads,
            prep_threads: self.prepthreads.unwrap_or_else(|| (threads / 4).max(1)),
            gpu_threads: self.gputhreads.unwrap_or(0),
            min_len,
            max_len,
            maxz: self.maxz.unwrap_or(3).clamp(1, 6),
            scale,
            dm: self.dm.unwrap_or(10.0),
            df,
            min_mass: self.min_mass.unwrap_or(500.0),
            max_mass: self.max_mass.unwrap_or(5000.0),
            min_shp: self.min_shp.unwrap_or(4),
            min_cpsm: self.min_cpsm.unwrap_or(4),
            top_matches: self.topmatches.unwrap_or(10).max(1),
            expect_max: self.expect_max.unwrap_or(20.0),
            scratch_mb: self.spadmem.unwrap_or(2048),
            policy: self.policy.unwrap_or_default(),
            mods,
            no_gpu_index: self.nogpuindex.unwrap_or(false),
            reindex: self.reindex.unwrap_or(false),
            no_cache: self.nocache.unwrap_or(false),
            match_charge: self.matchcharge.unwrap_or(false),
            no_progress: self.noprogress.unwrap_or(false),
            verbose: self.verbose.unwrap_or(false),
            nodes,
            rank,
        })
    }
}
