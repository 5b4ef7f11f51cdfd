//! Windowed audio dataset with speaker / frame labels and batch samplers

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::seqs::{SeqEntry, SeqLabels};
use crate::audio::AudioLoader;
use crate::config::SamplingType;
use crate::error::CpcError;

/// One training batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Audio windows (B, 1, W)
    pub audio: Tensor,
    /// Speaker index per window (B)
    pub speakers: Tensor,
    /// Frame labels (B, W / step) when labels are loaded
    pub phones: Option<Tensor>,
}

/// Sequences of the pack currently held in memory, concatenated
#[derive(Debug, Default)]
struct PackData {
    samples: Vec<f32>,
    /// Start offset of every speaker's audio, plus the total length
    speaker_bounds: Vec<usize>,
    /// Start offset of every sequence, plus the total length
    seq_bounds: Vec<usize>,
    labels: Vec<u32>,
}

/// Audio of a list of sequences cut into `size_window` windows.
///
/// Sequences are grouped into packs of at most `max_size_loaded` samples;
/// only one pack is held in memory at a time.
pub struct AudioBatchData {
    root: PathBuf,
    size_window: usize,
    sample_rate: u32,
    seqs: Vec<SeqEntry>,
    n_speakers: usize,
    labels: Option<SeqLabels>,
    packs: Vec<(usize, usize)>,
    total_size: usize,
    current_pack: Option<usize>,
    data: PackData,
}

impl AudioBatchData {
    /// Scan sequence lengths, split them into packs and load the first pack.
    #[allow(clippy::too_many_arguments)]
    pub fn new<P: AsRef<Path>>(
        root: P,
        size_window: usize,
        mut seqs: Vec<SeqEntry>,
        labels: Option<SeqLabels>,
        n_speakers: usize,
        max_size_loaded: usize,
        sample_rate: u32,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if seqs.is_empty() {
            return Err(CpcError::EmptyDataset(format!("no sequences under {:?}", root)).into());
        }
        seqs.shuffle(rng);

        let mut packs = Vec::new();
        let (mut start, mut pack_size, mut total_size) = (0, 0, 0);
        for (index, seq) in seqs.iter().enumerate() {
            pack_size += AudioLoader::duration_samples(root.join(&seq.path), sample_rate)?;
            if pack_size > max_size_loaded {
                packs.push((start, index + 1));
                total_size += pack_size;
                start = index + 1;
                pack_size = 0;
            }
        }
        if start < seqs.len() {
            packs.push((start, seqs.len()));
            total_size += pack_size;
        }
        info!("Scanned {} sequences, {} packs", seqs.len(), packs.len());

        let mut dataset = Self {
            root,
            size_window,
            sample_rate,
            seqs,
            n_speakers,
            labels,
            packs,
            total_size,
            current_pack: None,
            data: PackData::default(),
        };
        dataset.load_pack(0)?;
        Ok(dataset)
    }

    /// Window length in samples
    pub fn size_window(&self) -> usize {
        self.size_window
    }

    /// Packs the data is split into
    pub fn n_packs(&self) -> usize {
        self.packs.len()
    }

    /// Dataset root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sequences of the dataset
    pub fn seqs(&self) -> &[SeqEntry] {
        &self.seqs
    }

    /// Samples of the pack in memory
    pub fn loaded_len(&self) -> usize {
        self.data.samples.len()
    }

    /// Total number of windows across packs
    pub fn len(&self) -> usize {
        self.total_size / self.size_window
    }

    /// True without a single full window
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the frame labels and reload the current pack with them
    pub fn reset_phone_labels(&mut self, labels: SeqLabels) -> Result<()> {
        self.labels = Some(labels);
        let pack = self.current_pack.unwrap_or(0);
        self.current_pack = None;
        self.load_pack(pack)
    }

    /// Bring pack `index` into memory
    pub fn load_pack(&mut self, index: usize) -> Result<()> {
        if self.current_pack == Some(index) {
            return Ok(());
        }
        let Some(&(start, end)) = self.packs.get(index) else {
            bail!("pack {index} out of range ({} packs)", self.packs.len());
        };
        let mut entries: Vec<&SeqEntry> = self.seqs[start..end].iter().collect();
        entries.sort_by(|a, b| (a.speaker, a.name()).cmp(&(b.speaker, b.name())));

        let mut data = PackData {
            speaker_bounds: vec![0],
            seq_bounds: vec![0],
            ..Default::default()
        };
        let mut speaker = 0;
        for entry in entries {
            if entry.speaker >= self.n_speakers {
                bail!("speaker {} of {:?} out of range", entry.speaker, entry.path);
            }
            while speaker < entry.speaker {
                speaker += 1;
                data.speaker_bounds.push(data.samples.len());
            }
            let (mut samples, _) = AudioLoader::load(self.root.join(&entry.path), self.sample_rate)?;
            if let Some(labels) = &self.labels {
                let name = entry.name();
                let seq_labels = labels
                    .get(&name)
                    .with_context(|| format!("no frame labels for sequence {name}"))?;
                // keep audio and labels frame-aligned
                let frames = seq_labels.len().min(samples.len() / labels.step);
                samples.truncate(frames * labels.step);
                data.labels.extend_from_slice(&seq_labels[..frames]);
            }
            data.samples.extend_from_slice(&samples);
            data.seq_bounds.push(data.samples.len());
        }
        data.speaker_bounds.push(data.samples.len());

        debug!("Loaded pack {} with {} samples", index, data.samples.len());
        self.data = data;
        self.current_pack = Some(index);
        Ok(())
    }

    fn speaker_at(&self, offset: usize) -> u32 {
        let bounds = &self.data.speaker_bounds;
        let pos = bounds.partition_point(|&b| b <= offset);
        pos.saturating_sub(1) as u32
    }

    /// Window start offsets grouped into batches for the pack in memory
    pub fn sample_batches(
        &self,
        batch_size: usize,
        sampling: SamplingType,
        offset: usize,
        rng: &mut StdRng,
    ) -> Vec<Vec<usize>> {
        let w = self.size_window;
        let n = self.data.samples.len();
        match sampling {
            SamplingType::SameSpeaker => same_interval_batches(&self.data.speaker_bounds, w, offset, batch_size, rng),
            SamplingType::SameSequence => same_interval_batches(&self.data.seq_bounds, w, offset, batch_size, rng),
            SamplingType::Sequential => {
                let mut len = (n / w) / batch_size.max(1);
                if offset > 0 {
                    len = len.saturating_sub(1);
                }
                let starts: Vec<usize> = (0..batch_size).map(|x| x * (n / batch_size.max(1))).collect();
                (0..len)
                    .map(|idx| starts.iter().map(|s| offset + w * idx + s).collect())
                    .collect()
            }
            SamplingType::Uniform => {
                let mut len = n / w;
                if offset > 0 {
                    len = len.saturating_sub(1);
                }
                let mut order: Vec<usize> = (0..len).collect();
                order.shuffle(rng);
                order
                    .chunks_exact(batch_size.max(1))
                    .map(|c| c.iter().map(|i| offset + w * i).collect())
                    .collect()
            }
        }
    }

    /// Assemble the windows starting at `offsets` into a batch
    pub fn batch(&self, offsets: &[usize], device: &Device) -> Result<Batch> {
        let w = self.size_window;
        let mut audio = Vec::with_capacity(offsets.len() * w);
        let mut speakers = Vec::with_capacity(offsets.len());
        let mut phones = Vec::new();
        for &off in offsets {
            let Some(window) = self.data.samples.get(off..off + w) else {
                bail!("window at {off} runs past the {} loaded samples", self.data.samples.len());
            };
            audio.extend_from_slice(window);
            speakers.push(self.speaker_at(off));
            if let Some(labels) = &self.labels {
                let (first, count) = (off / labels.step, w / labels.step);
                let Some(frames) = self.data.labels.get(first..first + count) else {
                    bail!("frame labels end before window at {off}");
                };
                phones.extend_from_slice(frames);
            }
        }
        let b = offsets.len();
        let phones = match &self.labels {
            Some(labels) => Some(Tensor::from_vec(phones, (b, w / labels.step), device)?),
            None => None,
        };
        Ok(Batch {
            audio: Tensor::from_vec(audio, (b, 1, w), device)?,
            speakers: Tensor::from_vec(speakers, b, device)?,
            phones,
        })
    }

    /// Iterate over one epoch, loading packs in turn.
    ///
    /// With `random_offset` every pack's windows start at a random offset in
    /// `[0, size_window / 2]`.
    pub fn loader<'a>(
        &'a mut self,
        batch_size: usize,
        sampling: SamplingType,
        random_offset: bool,
        device: &'a Device,
        rng: &mut StdRng,
    ) -> DataLoader<'a> {
        DataLoader {
            n_batches: self.total_size / (self.size_window * batch_size.max(1)),
            dataset: self,
            batch_size,
            sampling,
            random_offset,
            device,
            rng: StdRng::seed_from_u64(rng.gen()),
            next_pack: 0,
            pending: Vec::new().into_iter(),
        }
    }
}

/// Batches drawn within each interval of `bounds` (speakers or sequences)
fn same_interval_batches(
    bounds: &[usize],
    w: usize,
    offset: usize,
    batch_size: usize,
    rng: &mut StdRng,
) -> Vec<Vec<usize>> {
    let mut batches = Vec::new();
    for pair in bounds.windows(2) {
        let mut size = (pair[1] - pair[0]) / w;
        if offset > 0 {
            size = size.saturating_sub(1);
        }
        let mut order: Vec<usize> = (0..size).collect();
        order.shuffle(rng);
        for chunk in order.chunks(batch_size.max(1)) {
            batches.push(chunk.iter().map(|x| offset + x * w + pair[0]).collect());
        }
    }
    batches.shuffle(rng);
    batches
}

/// Epoch iterator over the batches of every pack
pub struct DataLoader<'a> {
    dataset: &'a mut AudioBatchData,
    batch_size: usize,
    sampling: SamplingType,
    random_offset: bool,
    device: &'a Device,
    rng: StdRng,
    next_pack: usize,
    pending: std::vec::IntoIter<Vec<usize>>,
    n_batches: usize,
}

impl DataLoader<'_> {
    /// Approximate number of batches in the epoch
    pub fn n_batches(&self) -> usize {
        self.n_batches
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(offsets) = self.pending.next() {
                return Some(self.dataset.batch(&offsets, self.device));
            }
            if self.next_pack >= self.dataset.n_packs() {
                return None;
            }
            if let Err(e) = self.dataset.load_pack(self.next_pack) {
                self.next_pack = self.dataset.n_packs();
                return Some(Err(e));
            }
            self.next_pack += 1;
            let offset = if self.random_offset {
                self.rng.gen_range(0..=self.dataset.size_window / 2)
            } else {
                0
            };
            let batches = self
                .dataset
                .sample_batches(self.batch_size, self.sampling, offset, &mut self.rng);
            self.pending = batches.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn write_wav(path: &Path, n: usize, value: f32) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..n {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn dataset(dir: &Path, labels: Option<SeqLabels>, max_size: usize) -> AudioBatchData {
        write_wav(&dir.join("a/s1.wav"), 3200, 0.1);
        write_wav(&dir.join("a/s2.wav"), 1600, 0.2);
        write_wav(&dir.join("b/s3.wav"), 3200, 0.3);
        let seqs = vec![
            SeqEntry { speaker: 0, path: "a/s1.wav".into() },
            SeqEntry { speaker: 0, path: "a/s2.wav".into() },
            SeqEntry { speaker: 1, path: "b/s3.wav".into() },
        ];
        let mut rng = StdRng::seed_from_u64(3);
        AudioBatchData::new(dir, 800, seqs, labels, 2, max_size, 16000, &mut rng).unwrap()
    }

    #[test]
    fn test_single_pack_speaker_labels() {
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(dir.path(), None, usize::MAX);
        assert_eq!(data.n_packs(), 1);
        assert_eq!(data.loaded_len(), 8000);
        assert_eq!(data.len(), 10);
        assert_eq!(data.speaker_at(0), 0);
        assert_eq!(data.speaker_at(4799), 0);
        assert_eq!(data.speaker_at(4800), 1);
    }

    #[test]
    fn test_same_speaker_batches_never_mix() {
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(dir.path(), None, usize::MAX);
        let mut rng = StdRng::seed_from_u64(0);
        let batches = data.sample_batches(4, SamplingType::SameSpeaker, 0, &mut rng);
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 10);
        for offsets in batches {
            let b = data.batch(&offsets, &Device::Cpu).unwrap();
            let speakers: Vec<u32> = b.speakers.to_vec1().unwrap();
            assert!(speakers.iter().all(|&s| s == speakers[0]));
        }
    }

    #[test]
    fn test_uniform_and_sequential_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(dir.path(), None, usize::MAX);
        let mut rng = StdRng::seed_from_u64(0);
        let uniform = data.sample_batches(3, SamplingType::Uniform, 0, &mut rng);
        assert_eq!(uniform.len(), 3);
        let sequential = data.sample_batches(2, SamplingType::Sequential, 100, &mut rng);
        assert_eq!(sequential.len(), 4);
        assert_eq!(sequential[0], vec![100, 4100]);
        let batch = data.batch(&sequential[1], &Device::Cpu).unwrap();
        assert_eq!(batch.audio.dims(), &[2, 1, 800]);
        assert!(batch.phones.is_none());
    }

    #[test]
    fn test_packs_and_loader_cover_all_windows() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = dataset(dir.path(), None, 3000);
        assert!(data.n_packs() > 1);
        let mut rng = StdRng::seed_from_u64(1);
        let windows: usize = data
            .loader(1, SamplingType::Uniform, false, &Device::Cpu, &mut rng)
            .map(|b| b.unwrap().audio.dim(0).unwrap())
            .sum();
        assert_eq!(windows, 10);
    }

    #[test]
    fn test_frame_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("s1".to_string(), vec![1u32; 20]);
        labels.insert("s2".to_string(), vec![2u32; 5]);
        labels.insert("s3".to_string(), vec![3u32; 20]);
        let data = dataset(dir.path(), Some(SeqLabels::new(160, labels)), usize::MAX);
        // s2 truncated to its 5 labels
        assert_eq!(data.loaded_len(), 3200 + 800 + 3200);
        let batch = data.batch(&[0, 3200, 4000], &Device::Cpu).unwrap();
        let phones: Vec<Vec<u32>> = batch.phones.unwrap().to_vec2().unwrap();
        assert_eq!(phones[0], vec![1; 5]);
        assert_eq!(phones[1], vec![2; 5]);
        assert_eq!(phones[2], vec![3; 5]);
    }

    #[test]
    fn test_missing_labels_fail() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("a/x.wav"), 1600, 0.0);
        let seqs = vec![SeqEntry { speaker: 0, path: "a/x.wav".into() }];
        let mut rng = StdRng::seed_from_u64(0);
        let labels = SeqLabels::new(160, BTreeMap::new());
        assert!(AudioBatchData::new(dir.path(), 800, seqs, Some(labels), 1, usize::MAX, 16000, &mut rng).is_err());
    }
}
