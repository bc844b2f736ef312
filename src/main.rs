// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use phenocluster::pipeline::{self, EvaluationReport, Strategy};
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!(
        "Starting phenocluster ({} build) with args: {:?}",
        env!("PHENOCLUSTER_BUILD_PROFILE"),
        cli_args
    );

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Read Inputs ---
    info!("Reading feature vectors from {}", cli_args.features.display());
    let raw_features = input::read_features(&cli_args.features)?;
    info!("Reading phenotype labels from {}", cli_args.labels.display());
    let labels = input::read_labels(&cli_args.labels)?;
    info!(
        "Loaded {} feature vectors and {} labels.",
        raw_features.len(),
        labels.len()
    );

    // --- 2. Evaluate ---
    let config = cli_args.pipeline_config(num_threads);
    debug!("Pipeline configuration: {:?}", config);

    let pb_style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} NMF iterations ({percent}%) {msg}",
        )
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    let pb_nmf = ProgressBar::new(config.nmf_iterations as u64).with_style(pb_style);

    let report = pipeline::evaluate_observed(&raw_features, &labels, &config, |_, objective| {
        pb_nmf.inc(1);
        pb_nmf.set_message(format!("objective {:.4e}", objective));
    })?;
    pb_nmf.finish_with_message(format!(
        "NMF complete after {} iterations.",
        report.nmf.iterations()
    ));

    // --- 3. Write Outputs ---
    let output_prefix_path = PathBuf::from(&cli_args.output_prefix);
    if let Some(parent) = output_prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow!("Failed to create output directory {}: {}", parent.display(), e)
            })?;
            info!("Created output directory: {}", parent.display());
        }
    }
    info!(
        "Writing results to files with prefix '{}'...",
        cli_args.output_prefix
    );

    output_writer::write_purity(&cli_args.output_prefix, &report)?;
    output_writer::write_assignments(&cli_args.output_prefix, &report)?;
    output_writer::write_composition(&cli_args.output_prefix, &report)?;
    output_writer::write_eigenvalues(
        &cli_args.output_prefix,
        report.basis.explained_variance().as_slice().unwrap_or(&[]),
    )?;
    #[cfg(feature = "json-report")]
    output_writer::write_json_report(&cli_args.output_prefix, &report)?;

    for result in &report.strategies {
        println!("{}\t{:.5}", result.strategy, result.purity);
    }

    info!(
        "phenocluster finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use clap::{Parser, ValueEnum};
    use phenocluster::nmf::NonNegativePolicy;
    use phenocluster::DEFAULT_SEED;
    use phenocluster::pipeline::{NmfInput, PipelineConfig};
    use std::path::PathBuf;

    #[derive(ValueEnum, Clone, Copy, Debug)]
    pub(crate) enum NmfInputArg {
        Reduced,
        Standardized,
        Raw,
    }

    #[derive(ValueEnum, Clone, Copy, Debug)]
    pub(crate) enum NonNegativeArg {
        Reject,
        Clamp,
        Absolute,
    }

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Cluster patient feature vectors and score the clusters against phenotype labels.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Tab-separated patient ID followed by feature values.
        #[arg(long, required = true)]
        pub(crate) features: PathBuf,

        /// Tab-separated patient ID and phenotype code (1 case, 2 control, 3 unknown).
        #[arg(long, required = true)]
        pub(crate) labels: PathBuf,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,

        #[arg(short = 'k', long, default_value_t = 10)]
        pub(crate) components: usize,

        /// Cluster count for K-means and GMM, and the NMF rank.
        #[arg(short = 'c', long, default_value_t = 5)]
        pub(crate) clusters: usize,

        #[arg(long, default_value_t = 200)]
        pub(crate) nmf_iterations: usize,

        #[arg(long, default_value_t = 20)]
        pub(crate) kmeans_iterations: usize,

        #[arg(long, default_value_t = 20)]
        pub(crate) gmm_iterations: usize,

        #[arg(long, value_enum, default_value_t = NmfInputArg::Reduced)]
        pub(crate) nmf_input: NmfInputArg,

        #[arg(long, value_enum, default_value_t = NonNegativeArg::Absolute)]
        pub(crate) non_negative: NonNegativeArg,

        /// Stop NMF once the relative objective improvement drops below this.
        #[arg(long)]
        pub(crate) nmf_tolerance: Option<f64>,

        /// Row partitions for the NMF reductions. Defaults to the thread count;
        /// results are bitwise identical only for the same partition count.
        #[arg(long)]
        pub(crate) partitions: Option<usize>,

        #[arg(long, default_value_t = DEFAULT_SEED)]
        pub(crate) seed: u64,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }

    impl CliArgs {
        pub(crate) fn pipeline_config(&self, num_threads: usize) -> PipelineConfig {
            PipelineConfig {
                pca_components: self.components,
                clusters: self.clusters,
                kmeans_iterations: self.kmeans_iterations,
                gmm_iterations: self.gmm_iterations,
                nmf_iterations: self.nmf_iterations,
                nmf_tolerance: self.nmf_tolerance,
                nmf_input: match self.nmf_input {
                    NmfInputArg::Reduced => NmfInput::Reduced,
                    NmfInputArg::Standardized => NmfInput::Standardized,
                    NmfInputArg::Raw => NmfInput::Raw,
                },
                non_negative: match self.non_negative {
                    NonNegativeArg::Reject => NonNegativePolicy::Reject,
                    NonNegativeArg::Clamp => NonNegativePolicy::Clamp,
                    NonNegativeArg::Absolute => NonNegativePolicy::Absolute,
                },
                partitions: self.partitions.unwrap_or(num_threads),
                seed: self.seed,
            }
        }
    }

}

mod input {
    use super::{anyhow, debug, BufRead, BufReader, File, Path, Result};
    use phenocluster::{PatientId, PhenotypeClass};
    use std::collections::HashMap;

    /// Non-blank, non-`#` lines with their 1-based line numbers.
    fn data_lines(path: &Path) -> Result<Vec<(usize, String)>> {
        let file = File::open(path)
            .map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;
        let mut lines = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.trim().is_empty() || trimmed.starts_with('#') {
                continue;
            }
            lines.push((idx + 1, trimmed.to_string()));
        }
        Ok(lines)
    }

    /// A first line whose value columns are not all numeric is a header.
    fn skip_header(lines: &mut Vec<(usize, String)>, path: &Path) {
        let is_header = lines.first().is_some_and(|(_, line)| {
            line.split('\t')
                .skip(1)
                .any(|field| field.trim().parse::<f64>().is_err())
        });
        if is_header {
            let (line_no, _) = lines.remove(0);
            debug!("Treating line {} of {} as a header.", line_no, path.display());
        }
    }

    pub(crate) fn read_features(path: &Path) -> Result<HashMap<PatientId, Vec<f64>>> {
        let mut lines = data_lines(path)?;
        skip_header(&mut lines, path);

        let mut features = HashMap::with_capacity(lines.len());
        for (line_no, line) in lines {
            let mut fields = line.split('\t');
            let id = fields
                .next()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| anyhow!("{}:{}: missing patient ID", path.display(), line_no))?;
            let values = fields
                .map(|field| {
                    field.trim().parse::<f64>().map_err(|e| {
                        anyhow!(
                            "{}:{}: invalid feature value '{}': {}",
                            path.display(),
                            line_no,
                            field,
                            e
                        )
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            if values.is_empty() {
                return Err(anyhow!(
                    "{}:{}: patient '{}' has no feature values",
                    path.display(),
                    line_no,
                    id
                ));
            }
            if features.insert(PatientId::from(id), values).is_some() {
                return Err(anyhow!(
                    "{}:{}: duplicate patient ID '{}'",
                    path.display(),
                    line_no,
                    id
                ));
            }
        }
        if features.is_empty() {
            return Err(anyhow!("No feature vectors found in {}", path.display()));
        }
        Ok(features)
    }

    pub(crate) fn read_labels(path: &Path) -> Result<HashMap<PatientId, PhenotypeClass>> {
        let mut lines = data_lines(path)?;
        skip_header(&mut lines, path);

        let mut labels = HashMap::with_capacity(lines.len());
        for (line_no, line) in lines {
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            if fields.len() != 2 || fields[0].is_empty() {
                return Err(anyhow!(
                    "{}:{}: expected 'patient_id<TAB>code', found {} column(s)",
                    path.display(),
                    line_no,
                    fields.len()
                ));
            }
            let code = fields[1].parse::<i64>().map_err(|e| {
                anyhow!(
                    "{}:{}: invalid phenotype code '{}': {}",
                    path.display(),
                    line_no,
                    fields[1],
                    e
                )
            })?;
            let class = PhenotypeClass::from_code(code)
                .map_err(|e| anyhow!("{}:{}: {}", path.display(), line_no, e))?;
            if labels.insert(PatientId::from(fields[0]), class).is_some() {
                return Err(anyhow!(
                    "{}:{}: duplicate patient ID '{}'",
                    path.display(),
                    line_no,
                    fields[0]
                ));
            }
        }
        Ok(labels)
    }

}

mod output_writer {
    use super::{anyhow, info, BufWriter, EvaluationReport, File, Result, Strategy, Write};

    fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
        let filename = format!("{}.{}", prefix, suffix);
        File::create(&filename)
            .map(BufWriter::new)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", filename, e))
    }

    pub(crate) fn write_purity(output_prefix: &str, report: &EvaluationReport) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "purity.tsv")?;
        info!("Writing purity scores to {}.purity.tsv", output_prefix);

        writeln!(writer, "Strategy\tPurity\tJoined\tMissingLabel\tMissingAssignment")?;
        for result in &report.strategies {
            writeln!(
                writer,
                "{}\t{:.5}\t{}\t{}\t{}",
                result.strategy,
                result.purity,
                result.joined,
                result.missing_label,
                result.missing_assignment
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_assignments(output_prefix: &str, report: &EvaluationReport) -> Result<()> {
        let columns: Vec<_> = Strategy::ALL
            .iter()
            .filter_map(|&s| report.result(s))
            .collect();
        let Some(first) = columns.first() else {
            info!("No assignments to write.");
            return Ok(());
        };
        let mut writer = create_output_file(output_prefix, "assignments.tsv")?;
        info!("Writing cluster assignments to {}.assignments.tsv", output_prefix);

        write!(writer, "PatientID")?;
        for result in &columns {
            write!(writer, "\t{}", result.strategy)?;
        }
        writeln!(writer)?;

        // Every strategy assigns the same patients in the same order.
        for (row, assignment) in first.assignments.iter().enumerate() {
            write!(writer, "{}", assignment.patient_id)?;
            for result in &columns {
                match result.assignments.get(row) {
                    Some(a) => write!(writer, "\t{}", a.cluster)?,
                    None => write!(writer, "\tNA")?,
                }
            }
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_composition(output_prefix: &str, report: &EvaluationReport) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "composition.tsv")?;
        info!("Writing cluster composition to {}.composition.tsv", output_prefix);

        write!(writer, "Strategy\tCluster\tSize\tMajority")?;
        for class in phenocluster::PhenotypeClass::ALL {
            write!(writer, "\t{}", class)?;
        }
        writeln!(writer)?;

        for result in &report.strategies {
            for cluster in &result.composition {
                write!(
                    writer,
                    "{}\t{}\t{}\t{}",
                    result.strategy, cluster.cluster, cluster.size, cluster.majority
                )?;
                for class in phenocluster::PhenotypeClass::ALL {
                    write!(
                        writer,
                        "\t{}",
                        cluster.class_counts.get(&class).copied().unwrap_or(0)
                    )?;
                }
                writeln!(writer)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_eigenvalues(output_prefix: &str, pc_variances: &[f64]) -> Result<()> {
        if pc_variances.is_empty() {
            info!("No eigenvalues to write.");
            return Ok(());
        }
        let mut writer = create_output_file(output_prefix, "eigenvalues.tsv")?;
        info!("Writing eigenvalues to {}.eigenvalues.tsv", output_prefix);

        writeln!(writer, "PC\tEigenvalue")?;
        for (i, variance) in pc_variances.iter().enumerate() {
            writeln!(writer, "{}\t{:.6}", i + 1, variance)?;
        }
        writer.flush()?;
        Ok(())
    }

    #[cfg(feature = "json-report")]
    pub(crate) fn write_json_report(output_prefix: &str, report: &EvaluationReport) -> Result<()> {
        let strategies: Vec<serde_json::Value> = report
            .strategies
            .iter()
            .map(|result| {
                serde_json::json!({
                    "strategy": result.strategy.name(),
                    "purity": result.purity,
                    "joined": result.joined,
                    "missing_label": result.missing_label,
                    "missing_assignment": result.missing_assignment,
                    "clusters": result.composition.iter().map(|c| serde_json::json!({
                        "cluster": c.cluster,
                        "size": c.size,
                        "majority": c.majority.to_string(),
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        let document = serde_json::json!({
            "strategies": strategies,
            "explained_variance": report.basis.explained_variance().to_vec(),
            "zero_variance_dimensions": report.scaling.zero_variance_dimensions(),
            "nmf": {
                "iterations": report.nmf.iterations(),
                "reconstruction_error": report.nmf.reconstruction_error(),
                "objective_history": report.nmf.objective_history(),
            },
        });

        let mut writer = create_output_file(output_prefix, "report.json")?;
        info!("Writing JSON report to {}.report.json", output_prefix);
        serde_json::to_writer_pretty(&mut writer, &document)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}
