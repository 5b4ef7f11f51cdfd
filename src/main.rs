//! CPC CLI - train models, dump features and build pseudo labels

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cpc_audio::checkpoint::{load_model, read_args, LoadOptions};
use cpc_audio::clustering::{build_new_phone_dict, KMeans};
use cpc_audio::data::{build_feature, find_all_seqs, DEFAULT_MAX_SIZE_SEQ};
use cpc_audio::distributed::DistributedContext;
use cpc_audio::models::FeatureModule;
use cpc_audio::training::TrainingSession;
use cpc_audio::utils::npy::write_npy_f32;
use cpc_audio::{CpcConfig, VERSION};

/// CPC - self-supervised speech representations
#[derive(Parser, Debug)]
#[command(name = "cpc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train (or resume) a model
    Train {
        /// YAML or JSON run configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON object overlaid on the configuration, e.g. '{"n_epoch": 2}'
        #[arg(long)]
        set: Option<String>,

        /// Run directory (overrides `path_checkpoint`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Start from scratch even when the run directory holds checkpoints
        #[arg(long)]
        restart: bool,

        /// Use RANK / WORLD_SIZE / LOCAL_RANK from the environment
        #[arg(long)]
        distributed: bool,
    },

    /// Dump the features of one audio file to `.npy`
    Features {
        /// Checkpoint files; several give concatenated features
        #[arg(short, long, required = true, num_args = 1..)]
        checkpoint: Vec<PathBuf>,

        /// Input audio file
        #[arg(short, long)]
        input: PathBuf,

        /// Output `.npy` file, shape (frames, dims)
        #[arg(short, long, default_value = "features.npy")]
        output: PathBuf,

        /// Encoded features instead of context features
        #[arg(long)]
        encoded: bool,

        /// Normalize every feature over time
        #[arg(long)]
        seq_norm: bool,

        /// Use the best validation state instead of the last one
        #[arg(long)]
        best: bool,
    },

    /// Show the stored configuration and feature dims of a checkpoint
    Info {
        /// Checkpoint file
        #[arg(short, long)]
        checkpoint: PathBuf,
    },

    /// k-means pseudo labels for every file of a dataset
    Cluster {
        /// Checkpoint file
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Dataset root
        #[arg(short, long)]
        data: PathBuf,

        /// Number of clusters
        #[arg(short = 'k', long, default_value = "50")]
        n_clusters: usize,

        /// Audio file extension
        #[arg(long, default_value = ".wav")]
        extension: String,

        /// Files used to fit the clusters
        #[arg(long, default_value = "100")]
        max_fit_files: usize,

        /// Output JSON file
        #[arg(short, long, default_value = "labels.json")]
        output: PathBuf,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn create_progress_bar(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb
}

fn create_count_bar(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb
}

fn load_single(checkpoint: &[PathBuf], best: bool, device: &Device) -> Result<cpc_audio::checkpoint::LoadedModel> {
    let options = LoadOptions {
        load_best: best,
        ..Default::default()
    };
    load_model(checkpoint, &options, device)
}

fn train(
    config: Option<PathBuf>,
    set: Option<String>,
    output: Option<PathBuf>,
    restart: bool,
    distributed: bool,
    cpu: bool,
) -> Result<()> {
    let mut cfg = match &config {
        Some(path) => CpcConfig::load(path).context("Failed to load config")?,
        None => CpcConfig::default(),
    };
    if let Some(set) = set {
        let overrides: serde_json::Value = serde_json::from_str(&set).context("--set is not valid JSON")?;
        cfg = cfg.merge_json(&overrides)?;
    }
    if output.is_some() {
        cfg.path_checkpoint = output;
    }
    cfg.restart |= restart;
    cfg.distributed |= distributed;

    let dist = if cfg.distributed {
        DistributedContext::from_env()
    } else {
        DistributedContext::single()
    };
    let device = dist.device(cpu)?;
    info!("Device: {:?}", device);

    let pb = create_progress_bar("Loading data and model...");
    let mut session = TrainingSession::new(cfg, &device, dist)?;
    pb.finish_with_message("Ready");

    session.run()?;
    info!("Best validation accuracy: {:.4}", session.best_accuracy());
    Ok(())
}

fn features(
    checkpoint: Vec<PathBuf>,
    input: &Path,
    output: &Path,
    encoded: bool,
    seq_norm: bool,
    best: bool,
    device: &Device,
) -> Result<()> {
    let pb = create_progress_bar("Loading model...");
    let loaded = load_single(&checkpoint, best, device)?;
    pb.finish_with_message("Model loaded!");

    let module = FeatureModule::new(&loaded.model, encoded, false);
    let features = build_feature(&module, input, false, DEFAULT_MAX_SIZE_SEQ, seq_norm, device)?;
    let features = features.squeeze(0)?;
    let (frames, dims) = features.dims2()?;
    let data: Vec<f32> = features.flatten_all()?.to_vec1()?;
    write_npy_f32(output, &data, &[frames, dims])?;
    info!("Wrote {} x {} features to {:?}", frames, dims, output);
    Ok(())
}

fn show_info(checkpoint: &Path, device: &Device) -> Result<()> {
    let dir = checkpoint.parent().unwrap_or_else(|| Path::new("."));
    let args = read_args(dir, false)?;
    println!("{}", serde_json::to_string_pretty(&args)?);

    let options = LoadOptions {
        load_segment_cost: true,
        ..Default::default()
    };
    let loaded = load_model(&[checkpoint.to_path_buf()], &options, device)?;
    println!("hidden_gar: {}", loaded.hidden_gar);
    println!("hidden_encoder: {}", loaded.hidden_encoder);
    if let Some(cost) = loaded.segment_cost {
        println!("segment_cost: {cost:.4}");
    }
    for report in &loaded.reports {
        println!(
            "{}: {} tensors matched, {} missing, {} unexpected",
            report.component,
            report.found.len(),
            report.missing.len(),
            report.unexpected.len()
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cluster(
    checkpoint: &Path,
    data: &Path,
    k: usize,
    extension: &str,
    max_fit_files: usize,
    output: &Path,
    seed: u64,
    device: &Device,
) -> Result<()> {
    let loaded = load_single(&[checkpoint.to_path_buf()], false, device)?;
    let module = FeatureModule::new(&loaded.model, false, false);
    let (seqs, _) = find_all_seqs(data, extension, 1, false)?;
    info!("Found {} files under {:?}", seqs.len(), data);

    let n_fit = seqs.len().min(max_fit_files.max(1));
    let pb = create_count_bar(n_fit as u64, "Extracting");
    let mut rows = Vec::with_capacity(n_fit);
    for seq in &seqs[..n_fit] {
        let features = build_feature(&module, data.join(&seq.path), true, DEFAULT_MAX_SIZE_SEQ, false, device)?;
        rows.push(features.squeeze(0)?);
        pb.inc(1);
    }
    pb.finish_and_clear();
    let features = Tensor::cat(&rows, 0)?;

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let kmeans = KMeans::fit(&features, k, None, &mut rng)?;
    info!("Fitted {} clusters on {} frames", kmeans.k(), features.dim(0)?);

    let (labels, filling) = build_new_phone_dict(data, &seqs, &module, &kmeans, device)?;
    let json = serde_json::json!({
        "step": labels.step,
        "filling": filling,
        "labels": labels.labels,
    });
    std::fs::write(output, serde_json::to_string(&json)?).with_context(|| format!("Failed to write {:?}", output))?;
    info!("Wrote labels of {} files to {:?}", labels.labels.len(), output);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    info!("cpc v{}", VERSION);

    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    match cli.command {
        Commands::Train {
            config,
            set,
            output,
            restart,
            distributed,
        } => train(config, set, output, restart, distributed, cli.cpu),

        Commands::Features {
            checkpoint,
            input,
            output,
            encoded,
            seq_norm,
            best,
        } => features(checkpoint, &input, &output, encoded, seq_norm, best, &device),

        Commands::Info { checkpoint } => show_info(&checkpoint, &device),

        Commands::Cluster {
            checkpoint,
            data,
            n_clusters,
            extension,
            max_fit_files,
            output,
            seed,
        } => cluster(&checkpoint, &data, n_clusters, &extension, max_fit_files, &output, seed, &device),
    }
}
