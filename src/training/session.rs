//! End-to-end training run: data, model, criterion, optimizer and checkpoints

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::logs::{show_logs, untensor, update_logs, StepLogs, TrainingLogs};
use super::trainer::{set_seed, Trainer};
use crate::checkpoint::{
    self, checkpoint_path, get_checkpoint_data, load_criterion, load_model, snapshot, CheckpointState, LoadOptions,
    ARGS_FILE, LOGS_FILE,
};
use crate::clustering::{build_new_phone_dict, DeepClustering, Prototypes};
use crate::config::{load_args, CenterSource, ClusteringMode, CpcConfig, SamplingType, RESUME_FORBIDDEN_KEYS};
use crate::criterion::{build_criterion, Criterion, CriterionLabels};
use crate::data::{filter_seqs, find_all_seqs, parse_seq_labels, AudioBatchData, SeqEntry};
use crate::distributed::DistributedContext;
use crate::error::CpcError;
use crate::models::{FeatureModel, FeatureModule, ForwardContext};

/// Running mean of the merge cost needed to reach the target segment count
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentCostModel {
    sum: f64,
    count: usize,
}

impl SegmentCostModel {
    /// Start from a cost restored from a checkpoint
    pub fn from_initial(cost: Option<f64>) -> Self {
        match cost {
            Some(cost) => Self { sum: cost, count: 1 },
            None => Self::default(),
        }
    }

    /// Add one observed cost; non-finite costs are skipped
    pub fn update(&mut self, cost: f64) {
        if cost.is_finite() {
            self.sum += cost;
            self.count += 1;
        }
    }

    /// `None` until a cost was observed
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Features of one batch ready for the criterion
struct Forwarded {
    c_feature: Tensor,
    encoded: Tensor,
    push_loss: Option<Tensor>,
    segment_cost: Option<f64>,
}

/// Forward pass including the push-loss pass of CPC models that need it
fn forward_batch(model: &FeatureModel, audio: &Tensor, ctx: &ForwardContext) -> Result<Forwarded> {
    match model {
        FeatureModel::Cpc(cpc) => {
            let out = cpc.forward(audio, ctx)?;
            let segment_cost = out.segmentation.as_ref().and_then(|s| s.cost_at_target);
            if !cpc.doing_push_loss_or_push_after() {
                return Ok(Forwarded {
                    c_feature: out.c_feature,
                    encoded: out.encoded,
                    push_loss: None,
                    segment_cost,
                });
            }
            let push = cpc.push_losses(&out.c_feature, &out.encoded, ctx.centers, ctx)?;
            Ok(Forwarded {
                c_feature: push.c_feature,
                encoded: push.encoded,
                push_loss: Some(push.loss),
                segment_cost,
            })
        }
        other => {
            let (c_feature, encoded) = other.features(audio, ctx)?;
            Ok(Forwarded {
                c_feature,
                encoded,
                push_loss: None,
                segment_cost: None,
            })
        }
    }
}

/// Forward context of one pass.
///
/// Training segments down to the target count and feeds the segment cost
/// model; validation stops merging at the mean cost seen in training.
fn pass_context<'a>(
    centers: Option<&'a Tensor>,
    epoch: usize,
    total_epochs: usize,
    segment_cost: &SegmentCostModel,
    train: bool,
    train_model: bool,
) -> ForwardContext<'a> {
    ForwardContext {
        centers,
        epoch: epoch as f64,
        total_epochs: total_epochs as f64,
        max_segment_cost: if train { None } else { segment_cost.mean() },
        train: train && train_model,
    }
}

/// Train / validation sequence lists.
///
/// Without a validation split file the training list is shuffled and its
/// last 1% held out (at least one sequence when there are two or more).
fn split_seqs(config: &CpcConfig, seqs: &[SeqEntry], rng: &mut StdRng) -> Result<(Vec<SeqEntry>, Vec<SeqEntry>)> {
    let mut train = match &config.path_train {
        Some(path) => filter_seqs(path, seqs)?,
        None => seqs.to_vec(),
    };
    let mut val = match &config.path_val {
        Some(path) => filter_seqs(path, seqs)?,
        None => {
            train.shuffle(rng);
            let n = train.len();
            let size_train = ((0.99 * n as f64) as usize).min(n.saturating_sub(1)).max(1.min(n));
            train.split_off(size_train)
        }
    };
    if config.debug {
        train = train.split_off(train.len().saturating_sub(1000));
        val = val.split_off(val.len().saturating_sub(100));
    }
    Ok((train, val))
}

/// Centers used by the prototype / FCM options of the run
fn validate_centers(config: &CpcConfig, dims: (usize, usize), base_dim: usize) -> Result<(), CpcError> {
    let Some(fcm) = &config.fcm else {
        return Ok(());
    };
    if fcm.centers != CenterSource::KMeans {
        return Ok(());
    }
    if config.clustering != Some(ClusteringMode::DeepClustering) {
        return Err(CpcError::config("k-means centers need clustering = deepClustering"));
    }
    if fcm.m_before_ar.is_some() || fcm.m_after_ar.is_some() {
        return Err(CpcError::config("membership projections need learnable prototypes as centers"));
    }
    if dims.0 != base_dim {
        return Err(CpcError::DimensionMismatch {
            context: "k-means centers on the context features".into(),
            expected: base_dim,
            actual: dims.0,
        });
    }
    Ok(())
}

/// A full training run
pub struct TrainingSession {
    config: CpcConfig,
    device: Device,
    dist: DistributedContext,
    /// (dim_ctx, dim_enc) of the model features
    dims: (usize, usize),
    train_data: AudioBatchData,
    val_data: AudioBatchData,
    model: FeatureModel,
    model_varmap: VarMap,
    criterion: Criterion,
    criterion_varmap: VarMap,
    clustering: Option<DeepClustering>,
    prototypes: Option<Prototypes>,
    trainer: Trainer,
    logs: TrainingLogs,
    segment_cost: SegmentCostModel,
    rng: StdRng,
    best_acc: f64,
    best_state: Option<HashMap<String, Tensor>>,
    checkpoint_dir: Option<PathBuf>,
}

impl TrainingSession {
    /// Set up a run, resuming from `path_checkpoint` unless `restart` is set
    pub fn new(config: CpcConfig, device: &Device, dist: DistributedContext) -> Result<Self> {
        let mut config = config;
        let mut logs = TrainingLogs::new(config.save_step, config.logging_step);

        if let (Some(dir), false) = (config.path_checkpoint.clone(), config.restart) {
            if let Some(data) = get_checkpoint_data(&dir, false)? {
                info!("Resuming from {:?} (epoch {} done)", data.path, data.epoch);
                let forbidden: HashSet<&str> = RESUME_FORBIDDEN_KEYS.iter().copied().collect();
                config = load_args(&config, &data.args, Some(&forbidden))?;
                config.load = Some(vec![data.path]);
                config.load_criterion = true;
                logs = data.logs;
            }
        }
        config.finalize()?;
        let seed = config.random_seed.unwrap_or(0);
        let mut rng = set_seed(seed, device)?;
        info!("Random seed {}", seed);

        let (seqs, speakers) = find_all_seqs(
            &config.path_db,
            &config.file_extension,
            config.speaker_level,
            !config.ignore_cache,
        )?;
        info!("Found {} sequences from {} speakers", seqs.len(), speakers.len());
        let (mut seq_train, mut seq_val) = split_seqs(&config, &seqs, &mut rng)?;
        if config.distributed {
            seq_train = dist.shard(&seq_train);
            seq_val = dist.shard(&seq_val);
        }
        info!("Training set: {} sequences, validation set: {} sequences", seq_train.len(), seq_val.len());

        let (phone_labels, n_phones) = match &config.path_phone {
            Some(path) => {
                let (labels, n) = parse_seq_labels(path)?;
                info!("Loaded frame labels, {} classes", n);
                (Some(labels), Some(n))
            }
            None => (None, None),
        };
        if n_phones.is_some() && config.clustering.is_some() {
            return Err(CpcError::config("frame labels and clustering pseudo labels are exclusive").into());
        }

        let train_data = AudioBatchData::new(
            &config.path_db,
            config.size_window,
            seq_train,
            phone_labels.clone(),
            speakers.len(),
            config.max_size_loaded,
            config.sample_rate,
            &mut rng,
        )
        .context("Failed to load the training dataset")?;
        let val_data = AudioBatchData::new(
            &config.path_db,
            config.size_window,
            seq_val,
            phone_labels,
            speakers.len(),
            config.max_size_loaded,
            config.sample_rate,
            &mut rng,
        )
        .context("Failed to load the validation dataset")?;

        let mut segment_cost = SegmentCostModel::default();
        let (model, model_varmap, dims) = match &config.load {
            Some(paths) => {
                let options = LoadOptions {
                    fcm: config.fcm.clone(),
                    load_segment_cost: config.fcm.as_ref().map_or(false, |f| f.hier_ar_shorten.is_some()),
                    ..Default::default()
                };
                let loaded = load_model(paths, &options, device)?;
                segment_cost = SegmentCostModel::from_initial(loaded.segment_cost);
                (loaded.model, loaded.varmap, (loaded.hidden_gar, loaded.hidden_encoder))
            }
            None => {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
                let cpc = checkpoint::build_cpc_model(&config, config.fcm.clone(), vb)?;
                let dims = cpc.output_dims();
                (FeatureModel::Cpc(cpc), varmap, dims)
            }
        };
        info!("Model features: context {} / encoded {}", dims.0, dims.1);
        if config.reset_bn {
            info!("Resetting batch norm statistics");
            model.reset_running_stats()?;
        }

        let base_dim = model.cpc_models().first().map_or(dims.1, |m| m.base_dim());
        validate_centers(&config, dims, base_dim)?;

        let criterion_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&criterion_varmap, DType::F32, device);
        let criterion = build_criterion(&config, dims, speakers.len(), n_phones, vb.clone())?;
        let prototypes = match &config.fcm {
            Some(fcm) if fcm.centers == CenterSource::Prototypes => {
                Some(Prototypes::new(fcm.num_protos, base_dim, vb.clone())?)
            }
            _ => None,
        };
        let clustering = match config.clustering {
            Some(ClusteringMode::DeepClustering) => Some(DeepClustering::new(
                config.n_clusters,
                dims.0,
                config.cluster_delay,
                config.cluster_iter,
                config.clustering_update,
                config.dp_means_lambda,
                vb.pp("clustering"),
            )?),
            _ => None,
        };

        if let (true, Some(path)) = (config.load_criterion, config.load.as_ref().and_then(|l| l.first())) {
            info!("Loading the criterion from {:?}", path);
            load_criterion(path, &criterion_varmap, device)?;
        }

        let mut vars = criterion_varmap.all_vars();
        if config.eval_only {
            info!("Evaluation mode: the feature model is frozen");
        } else {
            info!("Optimizing model");
            vars.extend(model_varmap.all_vars());
        }
        let mut trainer = Trainer::new(vars, &config)?;
        for _ in 0..logs.start_epoch() {
            trainer.scheduler_step();
        }

        let checkpoint_dir = config.path_checkpoint.clone();
        if let (Some(dir), true) = (&checkpoint_dir, dist.is_master()) {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
            config.save_json(dir.join(ARGS_FILE))?;
        }

        Ok(Self {
            config,
            device: device.clone(),
            dist,
            dims,
            train_data,
            val_data,
            model,
            model_varmap,
            criterion,
            criterion_varmap,
            clustering,
            prototypes,
            trainer,
            logs,
            segment_cost,
            rng,
            best_acc: 0.0,
            best_state: None,
            checkpoint_dir,
        })
    }

    /// Configuration after resume and finalization
    pub fn config(&self) -> &CpcConfig {
        &self.config
    }

    /// (dim_ctx, dim_enc)
    pub fn dims(&self) -> (usize, usize) {
        self.dims
    }

    /// Feature model being trained
    pub fn model(&self) -> &FeatureModel {
        &self.model
    }

    /// Run logs
    pub fn logs(&self) -> &TrainingLogs {
        &self.logs
    }

    /// Best validation accuracy so far
    pub fn best_accuracy(&self) -> f64 {
        self.best_acc
    }

    /// Mean segment cost of the training steps
    pub fn segment_cost(&self) -> Option<f64> {
        self.segment_cost.mean()
    }

    /// Learning rate of the next step
    pub fn current_lr(&self) -> f64 {
        self.trainer.current_lr()
    }

    /// Prototypes, or the current k-means centers
    fn centers(&self) -> Result<Option<Tensor>> {
        let source = self.config.fcm.as_ref().map(|f| f.centers);
        match source {
            Some(CenterSource::Prototypes) => Ok(self.prototypes.as_ref().map(|p| p.centers().clone())),
            Some(CenterSource::KMeans) => self
                .clustering
                .as_ref()
                .and_then(DeepClustering::clusters)
                .map(|k| -> Result<Tensor> { Ok(k.centers().to_dtype(DType::F32)?.to_device(&self.device)?) })
                .transpose(),
            None => Ok(None),
        }
    }

    /// Refresh the clusters, then relabel both datasets from them
    fn update_clustering(&mut self, epoch: usize) -> Result<()> {
        let centers = self.centers()?;
        let Some(clustering) = self.clustering.as_mut() else {
            return Ok(());
        };
        let model = &self.model;
        let ctx = ForwardContext {
            centers: centers.as_ref(),
            epoch: epoch as f64,
            total_epochs: self.config.n_epoch as f64,
            ..ForwardContext::eval()
        };
        clustering.update_clusters(
            &mut self.train_data,
            self.config.batch_size(),
            &self.device,
            &mut self.rng,
            |batch| Ok(model.features(&batch.audio, &ctx)?.0),
        )?;
        let Some(kmeans) = clustering.clusters() else {
            debug!("Clustering not active yet");
            return Ok(());
        };
        let centers = match self.config.fcm.as_ref().map(|f| f.centers) {
            Some(CenterSource::KMeans) => Some(kmeans.centers().to_dtype(DType::F32)?.to_device(&self.device)?),
            _ => centers,
        };
        let module = FeatureModule::new(model, false, false).with_centers(centers.as_ref());
        for (name, data) in [("train", &mut self.train_data), ("val", &mut self.val_data)] {
            let (labels, filling) = build_new_phone_dict(data.root(), data.seqs(), &module, kmeans, &self.device)?;
            data.reset_phone_labels(labels)?;
            let empty = filling.iter().filter(|&&n| n == 0).count();
            info!("{} labels rebuilt, {} empty clusters out of {}", name, empty, filling.len());
        }
        Ok(())
    }

    /// One pass over the training set
    pub fn train_step(&mut self, epoch: usize) -> Result<StepLogs> {
        let centers = self.centers()?;
        let logging_step = self.config.logging_step.max(1);
        let train_model = !self.config.eval_only;
        let batch_size = self.config.batch_size();
        let mut logs = StepLogs::new();
        let mut last_logs: Option<StepLogs> = None;
        let start = Instant::now();
        let mut forward_time = 0.0;

        let loader = self
            .train_data
            .loader(batch_size, self.config.sampling_type, true, &self.device, &mut self.rng);
        for (step, batch) in loader.enumerate() {
            let batch = batch?;
            let ctx = pass_context(centers.as_ref(), epoch, self.config.n_epoch, &self.segment_cost, true, train_model);
            let t = Instant::now();
            let out = forward_batch(&self.model, &batch.audio, &ctx)?;
            let labels = CriterionLabels {
                speakers: &batch.speakers,
                phones: batch.phones.as_ref(),
            };
            let (losses, accs) = self.criterion.forward(&out.c_feature, &out.encoded, labels, true)?;
            forward_time += t.elapsed().as_secs_f64();

            let mut total = losses.sum_all()?;
            logs.accumulate("locLoss_train", &untensor(&losses)?);
            logs.accumulate("locAcc_train", &untensor(&accs)?);
            if let Some(push) = &out.push_loss {
                total = (total + push)?;
                logs.accumulate("pushLoss", &untensor(push)?);
            }
            if let (Some(clustering), Some(phones)) = (&self.clustering, batch.phones.as_ref()) {
                if clustering.can_run() {
                    let loss = clustering.forward(&out.c_feature, phones)?;
                    total = (total + loss.sum_all()?)?;
                    logs.accumulate("lossCluster_train", &untensor(&loss)?);
                }
            }
            if let Some(cost) = out.segment_cost {
                self.segment_cost.update(cost);
            }

            self.trainer.backward_step(&total)?;
            logs.iter += 1;

            if (step + 1) % logging_step == 0 {
                let elapsed = start.elapsed().as_secs_f64();
                info!("Update {}", step + 1);
                info!(
                    "{:.1} ms per batch, {:.1} ms / batch forward",
                    1000.0 * elapsed / (step + 1) as f64,
                    1000.0 * forward_time / (step + 1) as f64
                );
                let loc_logs = update_logs(&logs, logging_step, last_logs.as_ref());
                last_logs = Some(logs.clone());
                show_logs("Training loss", &loc_logs);
            }
        }
        if logs.iter == 0 {
            warn!("The training set produced no batch");
        }
        Ok(update_logs(&logs, logs.iter, None))
    }

    /// One pass over the validation set in storage order
    pub fn val_step(&mut self, epoch: usize) -> Result<StepLogs> {
        let centers = self.centers()?;
        let ctx = pass_context(centers.as_ref(), epoch, self.config.n_epoch, &self.segment_cost, false, false);
        let batch_size = self.config.batch_size();
        let mut logs = StepLogs::new();

        let loader = self
            .val_data
            .loader(batch_size, SamplingType::Sequential, false, &self.device, &mut self.rng);
        for batch in loader {
            let batch = batch?;
            let out = forward_batch(&self.model, &batch.audio, &ctx)?;
            let labels = CriterionLabels {
                speakers: &batch.speakers,
                phones: batch.phones.as_ref(),
            };
            let (losses, accs) = self.criterion.forward(&out.c_feature, &out.encoded, labels, false)?;
            logs.accumulate("locLoss_val", &untensor(&losses)?);
            logs.accumulate("locAcc_val", &untensor(&accs)?);
            if let (Some(clustering), Some(phones)) = (&self.clustering, batch.phones.as_ref()) {
                if clustering.can_run() {
                    let loss = clustering.forward(&out.c_feature, phones)?;
                    logs.accumulate("lossCluster_val", &untensor(&loss)?);
                }
            }
            logs.iter += 1;
        }
        let logs = update_logs(&logs, logs.iter, None);
        show_logs("Validation loss:", &logs);
        Ok(logs)
    }

    /// Write the checkpoint of `epoch` and the run logs
    pub fn save(&self, epoch: usize) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.checkpoint_dir else {
            return Ok(None);
        };
        if !self.dist.is_master() {
            return Ok(None);
        }
        let path = checkpoint_path(dir, epoch);
        let state = CheckpointState {
            model: &self.model_varmap,
            criterion: &self.criterion_varmap,
            best: self.best_state.as_ref(),
            segment_cost: self.segment_cost.mean(),
        };
        checkpoint::save_checkpoint(&state, &path)?;
        self.logs.save(dir.join(LOGS_FILE))?;
        Ok(Some(path))
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<()> {
        info!("Starting epoch {}", epoch);
        self.update_clustering(epoch)?;

        let train_logs = self.train_step(epoch)?;
        let val_logs = self.val_step(epoch)?;

        if let Some(acc) = val_logs.mean("locAcc_val") {
            if acc > self.best_acc || self.best_state.is_none() {
                info!("New best validation accuracy {:.4}", acc);
                self.best_acc = self.best_acc.max(acc);
                self.best_state = Some(snapshot(&self.model_varmap)?);
            }
        }
        info!("Ran {} epochs", epoch + 1);
        self.logs.push_epoch(epoch, &[&train_logs, &val_logs]);

        let save_step = self.logs.save_step.max(1);
        if epoch % save_step == 0 || epoch + 1 == self.config.n_epoch {
            if let Some(path) = self.save(epoch)? {
                info!("Checkpoint saved to {:?}", path);
            }
        }
        self.trainer.scheduler_step();
        Ok(())
    }

    /// Train from the first unfinished epoch up to `n_epoch`
    pub fn run(&mut self) -> Result<()> {
        let start = self.logs.start_epoch();
        info!("Running {} epochs, starting at {}", self.config.n_epoch, start);
        if start >= self.config.n_epoch {
            warn!("Nothing to do: {} epochs already done", start);
        }
        for epoch in start..self.config.n_epoch {
            self.run_epoch(epoch)?;
        }
        Ok(())
    }

    /// Checkpoint directory of the run, if any
    pub fn checkpoint_dir(&self) -> Option<&Path> {
        self.checkpoint_dir.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn seqs(n: usize) -> Vec<SeqEntry> {
        (0..n)
            .map(|i| SeqEntry {
                speaker: i % 2,
                path: PathBuf::from(format!("s{i}.wav")),
            })
            .collect()
    }

    #[test]
    fn test_segment_cost_running_mean() {
        let mut model = SegmentCostModel::default();
        assert_eq!(model.mean(), None);
        model.update(1.0);
        model.update(3.0);
        model.update(f64::NAN);
        assert_eq!(model.mean(), Some(2.0));
        let restored = SegmentCostModel::from_initial(Some(4.0));
        assert_eq!(restored.mean(), Some(4.0));
    }

    #[test]
    fn test_validation_stops_at_training_segment_cost() {
        let mut cost = SegmentCostModel::default();
        let val = pass_context(None, 1, 4, &cost, false, true);
        assert_eq!(val.max_segment_cost, None);
        assert!(!val.train);

        cost.update(0.5);
        cost.update(1.5);
        let train = pass_context(None, 1, 4, &cost, true, true);
        assert_eq!(train.max_segment_cost, None);
        assert!(train.train);
        assert_eq!((train.epoch, train.total_epochs), (1.0, 4.0));
        let val = pass_context(None, 1, 4, &cost, false, true);
        assert_eq!(val.max_segment_cost, Some(1.0));

        let frozen = pass_context(None, 1, 4, &cost, true, false);
        assert!(!frozen.train);
    }

    #[test]
    fn test_split_holds_out_validation() {
        let config = CpcConfig::default();
        let mut rng = StdRng::seed_from_u64(0);
        let (train, val) = split_seqs(&config, &seqs(200), &mut rng).unwrap();
        assert_eq!((train.len(), val.len()), (198, 2));

        let (train, val) = split_seqs(&config, &seqs(3), &mut rng).unwrap();
        assert_eq!((train.len(), val.len()), (2, 1));
    }

    #[test]
    fn test_split_debug_keeps_tail() {
        let config = CpcConfig {
            debug: true,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (train, val) = split_seqs(&config, &seqs(2000), &mut rng).unwrap();
        assert_eq!(train.len(), 1000);
        assert_eq!(val.len(), 20);
    }

    #[test]
    fn test_kmeans_centers_need_clustering() {
        let config = CpcConfig {
            fcm: Some(crate::config::FcmSettings {
                centers: CenterSource::KMeans,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate_centers(&config, (8, 8), 8).is_err());
        let config = CpcConfig {
            clustering: Some(ClusteringMode::DeepClustering),
            ..config
        };
        assert!(validate_centers(&config, (8, 8), 8).is_ok());
        assert!(validate_centers(&config, (16, 8), 8).is_err());
    }
}
