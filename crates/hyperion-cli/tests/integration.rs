use hyperion_core::index::{write_index, FragmentIndex, IonChunk, LengthIndex, PeptideEntry};
use std::io::Write;
use std::process::Command;

fn tiny_index() -> FragmentIndex {
    // One 9-mer at 1000 Da with two b and two y ions (scale 100)
    let records = [(15_000u32, 0u32), (25_000, 1), (35_000, 16), (45_000, 17)];
    let mut bins = vec![0u32; 500_002];
    for &(bin, _) in &records {
        bins[bin as usize + 1] += 1;
    }
    for b in 1..bins.len() {
        bins[b] += bins[b - 1];
    }

    FragmentIndex {
        scale: 100,
        maxz: 2,
        max_mz: 500_000,
        lengths: vec![LengthIndex {
            peptide_len: 9,
            entries: vec![PeptideEntry {
                mass: 1000.0,
                seq_id: 7,
            }],
            chunks: vec![IonChunk {
                bins,
                ions: records.iter().map(|&(_, slot)| slot).collect(),
            }],
            chunk_size: 1,
            last_chunk_size: 1,
        }],
    }
}

#[test]
fn cli_end_to_end() {
    let dir = tempfile::tempdir().unwrap();

    let index_path = dir.path().join("db.hxi");
    write_index(&tiny_index(), &index_path).unwrap();

    let ms2_path = dir.path().join("run1.ms2");
    let mut fh = std::fs::File::create(&ms2_path).unwrap();
    writeln!(fh, "H\tCreationDate\t2025").unwrap();
    writeln!(fh, "S\t1\t1\t1000.0").unwrap();
    for peak in ["150.0 1000", "250.0 1000", "350.0 1000", "450.0 1000"] {
        writeln!(fh, "{}", peak).unwrap();
    }
    drop(fh);

    let workspace = dir.path().join("out");
    let params_path = dir.path().join("params.json");
    std::fs::write(
        &params_path,
        serde_json::json!({
            "dbpath": index_path.display().to_string(),
            "dataset": [ms2_path.display().to_string()],
            "workspace": workspace.display().to_string(),
            "threads": 2,
            "min_shp": 4,
            "min_cpsm": 1,
            "dM": 10.0,
            "dF": 0.0
        })
        .to_string(),
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_hyperion"))
        .arg(&params_path)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let results = std::fs::read_to_string(workspace.join("results.hyperion.tsv")).unwrap();
    let lines: Vec<&str> = results.lines().collect();
    assert_eq!(lines.len(), 2, "header plus one PSM: {:?}", lines);
    assert!(lines[0].starts_with("spectrum_id\t"));
    let fields: Vec<&str> = lines[1].split('\t').collect();
    assert_eq!(fields[0], "0"); // spectrum id
    assert_eq!(fields[3], "7"); // peptide seq id

    // The finalized parameters are echoed for reproducibility
    assert!(workspace.join("results.json").exists());
}
