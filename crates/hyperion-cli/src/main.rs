use anyhow::Context;
use clap::{Arg, Command, ValueHint};
use hyperion_core::config::Builder;
use hyperion_core::index::read_index;
use hyperion_core::manager::run_search;
use log::info;
use std::sync::Arc;
use std::time::Instant;

mod output;

fn main() -> anyhow::Result<()> {
    let matches = Command::new("hyperion")
        .version(clap::crate_version!())
        .about("High-throughput peptide-spectrum matching against a fragment-ion index")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("ms2_paths")
                .num_args(1..)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Paths to MS2 files to search. Overrides the dataset listed in the \
                     configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("dbpath")
                .short('d')
                .long("dbpath")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to the pre-built fragment-ion index. Overrides the configuration file.")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("workspace")
                .short('o')
                .long("workspace")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Directory where results and staging files are written.")
                .value_hint(ValueHint::DirPath),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    let start = Instant::now();

    let path = matches
        .get_one::<String>("parameters")
        .expect("required parameters");
    let mut builder: Builder = serde_json::from_str(
        &std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters from `{}`", path))?,
    )
    .with_context(|| format!("Failed to parse parameters from `{}`", path))?;

    if let Some(paths) = matches.get_many::<String>("ms2_paths") {
        builder.dataset = Some(paths.cloned().collect());
    }
    if let Some(dbpath) = matches.get_one::<String>("dbpath") {
        builder.dbpath = Some(dbpath.clone());
    }
    if let Some(workspace) = matches.get_one::<String>("workspace") {
        builder.workspace = Some(workspace.clone());
    }
    if builder.threads.is_none() {
        builder.threads = Some(num_cpus::get());
    }

    let params = builder.build()?;

    let default_filter = if params.verbose {
        "error,hyperion_core=trace,hyperion=trace"
    } else {
        "error,hyperion_core=info,hyperion=info"
    };
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("HYPERION_LOG", default_filter))
        .init();

    std::fs::create_dir_all(&params.workspace).with_context(|| {
        format!(
            "Failed to create workspace `{}`",
            params.workspace.display()
        )
    })?;

    let index = read_index(&params.index_path).with_context(|| {
        format!(
            "Failed to load fragment index from `{}`",
            params.index_path.display()
        )
    })?;
    info!(
        "loaded {} peptides, {} ions across {} length chunks in {:#?}",
        index.num_peptides(),
        index.num_ions(),
        index.lengths.len(),
        start.elapsed()
    );

    let results_path = params.workspace.join("results.hyperion.tsv");
    let sink = Arc::new(output::TsvSink::create(&results_path)?);

    let summary = run_search(params.clone(), index, sink.clone())?;
    info!(
        "searched {} spectra in {} batches from {} files",
        summary.spectra, summary.batches, summary.files
    );
    info!(
        "reported {} PSMs under expect {}",
        summary.reported, params.expect_max
    );

    Arc::try_unwrap(sink)
        .map_err(|_| anyhow::anyhow!("output sink still shared at shutdown"))?
        .finish()?;

    let manifest = params.workspace.join("results.json");
    std::fs::write(&manifest, serde_json::to_vec_pretty(&params)?)?;
    println!("{}", serde_json::to_string_pretty(&params)?);

    info!("finished in {:#?}", start.elapsed());
    Ok(())
}
