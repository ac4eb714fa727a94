use hyperion_core::error::{EngineError, Result};
use hyperion_core::sink::{OutputSink, Psm};
use parking_lot::Mutex;
use std::fs::File;
use std::path::Path;

/// Tab-separated PSM writer. A single mutex serializes reporters; one
/// record per PSM in scoring order.
pub struct TsvSink {
    writer: Mutex<csv::Writer<File>>,
}

pub const HEADERS: [&str; 9] = [
    "spectrum_id",
    "precursor_mass",
    "peptide_len",
    "peptide",
    "hyperscore",
    "shared_ions",
    "total_ions",
    "cpsms",
    "expect",
];

fn broken_pipe(e: csv::Error) -> EngineError {
    EngineError::Io(std::io::Error::other(e))
}

impl TsvSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(File::create(path)?);
        writer
            .write_byte_record(&csv::ByteRecord::from(HEADERS.to_vec()))
            .map_err(broken_pipe)?;
        Ok(TsvSink {
            writer: Mutex::new(writer),
        })
    }

    fn record(psm: &Psm) -> csv::ByteRecord {
        let mut record = csv::ByteRecord::new();
        record.push_field(itoa::Buffer::new().format(psm.spectrum_id).as_bytes());
        record.push_field(ryu::Buffer::new().format(psm.precursor_mass).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.peptide_len).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.peptide).as_bytes());
        record.push_field(ryu::Buffer::new().format(psm.hyperscore).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.shared_ions).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.total_ions).as_bytes());
        record.push_field(itoa::Buffer::new().format(psm.cpsms).as_bytes());
        record.push_field(ryu::Buffer::new().format(psm.expect).as_bytes());
        record
    }

    pub fn finish(self) -> Result<()> {
        self.writer
            .into_inner()
            .flush()
            .map_err(EngineError::Io)?;
        Ok(())
    }
}

impl OutputSink for TsvSink {
    fn report(&self, psm: &Psm) -> Result<()> {
        self.writer
            .lock()
            .write_byte_record(&Self::record(psm))
            .map_err(broken_pipe)
    }
}
