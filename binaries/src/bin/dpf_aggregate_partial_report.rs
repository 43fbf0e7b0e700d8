// SPDX-License-Identifier: MPL-2.0

//! Expands one helper's DPF key halves into its partial histogram.
//!
//! ```text
//! dpf_aggregate_partial_report \
//!   --partial_report_uri=/path/to/dpf_keys.json \
//!   --expand_parameters_uri=/path/to/expand_parameters.json \
//!   --partial_histogram_uri=/path/to/partial_histogram.json \
//!   --decrypted_report_uri=/path/to/evaluation_context.json \
//!   --private_key_params_uri=/path/to/private_keys.json
//! ```
//!
//! The partial report input holds either the sealed DPF key halves or an evaluation context
//! written to `--decrypted_report_uri` by an earlier run. Set `RUST_LOG` to control logging.

use clap::{ArgAction, Parser};
use color_eyre::eyre::{eyre, Result, WrapErr};
use conversion_aggregation::{
    aggregator::CombineParams,
    dpf::{
        convert_old_params_to_expand_parameters, default_dpf_parameters, DpfParameters,
        ExpandParameters, HierarchicalPrefixes,
    },
    keys::ServerKeyMaterial,
    pipeline::{aggregate_partial_report, AggregatePartialReportParams, PartialReportInput},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Aggregate the partial reports of one helper into a partial histogram")]
struct Options {
    /// Input partial reports: the sealed DPF key halves or an evaluation context.
    #[arg(long = "partial_report_uri")]
    partial_report_uri: PathBuf,

    /// Input expansion parameters.
    #[arg(long = "expand_parameters_uri")]
    expand_parameters_uri: Option<PathBuf>,

    /// Output partial histogram.
    #[arg(long = "partial_histogram_uri")]
    partial_histogram_uri: PathBuf,

    /// Output the evaluation context so a later run needs no decryption.
    #[arg(long = "decrypted_report_uri")]
    decrypted_report_uri: Option<PathBuf>,

    /// Bit size of the conversion keys.
    #[arg(long = "key_bit_size", default_value_t = 32)]
    key_bit_size: u32,

    /// Input private key collection of this helper.
    #[arg(long = "private_key_params_uri")]
    private_key_params_uri: PathBuf,

    /// Use direct or segmented combine when summing the expanded vectors.
    #[arg(long = "direct_combine", default_value_t = true, action = ArgAction::Set)]
    direct_combine: bool,

    /// Segment length for segmented combine.
    #[arg(long = "segment_length", default_value_t = 32768)]
    segment_length: usize,

    /// Epsilon for the privacy budget.
    #[arg(long = "epsilon", default_value_t = 0.0)]
    epsilon: f64,

    /// L1 sensitivity for the privacy budget.
    #[arg(long = "l1_sensitivity", default_value_t = 1 << 16)]
    l1_sensitivity: u64,

    /// Number of shards of the output histogram.
    #[arg(long = "file_shards", default_value_t = 1)]
    file_shards: usize,

    /// Legacy: DPF parameters for the sum, used with --prefixes_uri instead of
    /// --expand_parameters_uri.
    #[arg(long = "sum_parameters_uri")]
    sum_parameters_uri: Option<PathBuf>,

    /// Legacy: prefixes for hierarchical expansion.
    #[arg(long = "prefixes_uri")]
    prefixes_uri: Option<PathBuf>,
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let file =
        File::open(path).wrap_err_with(|| format!("could not open {what} {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .wrap_err_with(|| format!("could not parse {what} {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    let file = File::create(path)
        .wrap_err_with(|| format!("could not create {what} {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .wrap_err_with(|| format!("could not write {what} {}", path.display()))?;
    writer
        .flush()
        .wrap_err_with(|| format!("could not write {what} {}", path.display()))
}

/// `<uri>-NNNNN-of-MMMMM`, or `uri` itself for a single shard.
fn shard_path(uri: &Path, index: usize, count: usize) -> PathBuf {
    if count == 1 {
        return uri.to_path_buf();
    }
    let mut name = uri.as_os_str().to_owned();
    name.push(format!("-{index:05}-of-{count:05}"));
    PathBuf::from(name)
}

fn expand_parameters(options: &Options) -> Result<ExpandParameters> {
    match (
        &options.expand_parameters_uri,
        &options.sum_parameters_uri,
        &options.prefixes_uri,
    ) {
        (Some(uri), _, _) => read_json(uri, "expand parameters"),
        (None, Some(sum_parameters_uri), Some(prefixes_uri)) => {
            let sum_params: DpfParameters = read_json(sum_parameters_uri, "sum parameters")?;
            let prefixes: HierarchicalPrefixes = read_json(prefixes_uri, "prefixes")?;
            convert_old_params_to_expand_parameters(&sum_params, &prefixes)
                .wrap_err("could not convert legacy parameters")
        }
        _ => Err(eyre!(
            "either --expand_parameters_uri or both --sum_parameters_uri and --prefixes_uri \
             are required"
        )),
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let options = Options::parse();

    let private_keys: ServerKeyMaterial =
        read_json(&options.private_key_params_uri, "private keys")?;
    let expand_parameters = expand_parameters(&options)?;
    // Hierarchies are defined for every prefix length of the bucket id.
    let dpf_parameters =
        default_dpf_parameters(options.key_bit_size).wrap_err("invalid --key_bit_size")?;
    let combine = CombineParams {
        direct_combine: options.direct_combine,
        segment_length: options.segment_length,
        epsilon: options.epsilon,
        l1_sensitivity: options.l1_sensitivity,
    };
    let input: PartialReportInput = read_json(&options.partial_report_uri, "partial reports")?;

    let output = aggregate_partial_report(
        &AggregatePartialReportParams {
            dpf_parameters: &dpf_parameters,
            private_keys: &private_keys,
            expand_parameters: &expand_parameters,
            combine: &combine,
            ignore_privacy: false,
            return_evaluation_context: options.decrypted_report_uri.is_some(),
        },
        input,
    )
    .wrap_err("failed to aggregate partial reports")?;

    if let (Some(uri), Some(context)) = (&options.decrypted_report_uri, &output.evaluation_context)
    {
        write_json(uri, context, "evaluation context")?;
    }

    let prefix_bits = output.histogram.prefix_bits;
    let shards = output
        .histogram
        .into_shards(options.file_shards)
        .wrap_err("invalid --file_shards")?;
    for (index, shard) in shards.iter().enumerate() {
        let path = shard_path(&options.partial_histogram_uri, index, shards.len());
        write_json(&path, shard, "partial histogram")?;
    }
    info!(prefix_bits, shards = shards.len(), "wrote partial histogram");
    Ok(())
}
