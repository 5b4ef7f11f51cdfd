//! Sequence listing, split filtering and frame label files

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the listing cache written at the dataset root
pub const SEQ_CACHE_FILE: &str = "_seqs_cache.json";

/// Audio samples covered by one frame label
pub const LABEL_STEP: usize = 160;

/// One audio file of the dataset
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeqEntry {
    /// Speaker index into the speaker list
    pub speaker: usize,
    /// Path relative to the dataset root
    pub path: PathBuf,
}

impl SeqEntry {
    /// File stem, the key of the label files
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize)]
struct SeqCache {
    seqs: Vec<SeqEntry>,
    speakers: Vec<String>,
}

/// List every file with `extension` below `dir`.
///
/// The speaker of a file is the first `speaker_level` directory components
/// of its parent, relative to `dir`. With `load_cache` a previous listing is
/// read back from `_seqs_cache.json`; a fresh listing is always written there.
pub fn find_all_seqs<P: AsRef<Path>>(
    dir: P,
    extension: &str,
    speaker_level: usize,
    load_cache: bool,
) -> Result<(Vec<SeqEntry>, Vec<String>)> {
    let dir = dir.as_ref();
    let cache_path = dir.join(SEQ_CACHE_FILE);
    if load_cache {
        match std::fs::read_to_string(&cache_path) {
            Ok(content) => {
                let cache: SeqCache = serde_json::from_str(&content)
                    .with_context(|| format!("Corrupt sequence cache {:?}", cache_path))?;
                info!("Loaded sequence listing from cache {:?}", cache_path);
                return Ok((cache.seqs, cache.speakers));
            }
            Err(e) => warn!("Could not read sequence cache {:?}: {}", cache_path, e),
        }
    }

    let mut speaker_ids: HashMap<String, usize> = HashMap::new();
    let mut speakers = Vec::new();
    let mut seqs = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(extension) {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path()).to_path_buf();
        let speaker_str = relative
            .parent()
            .map(|p| {
                p.components()
                    .take(speaker_level)
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();
        let speaker = *speaker_ids.entry(speaker_str.clone()).or_insert_with(|| {
            speakers.push(speaker_str);
            speakers.len() - 1
        });
        seqs.push(SeqEntry {
            speaker,
            path: relative,
        });
    }

    let cache = SeqCache { seqs, speakers };
    match serde_json::to_string(&cache) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&cache_path, json) {
                warn!("Could not write sequence cache {:?}: {}", cache_path, e);
            }
        }
        Err(e) => warn!("Could not serialize sequence cache: {}", e),
    }
    Ok((cache.seqs, cache.speakers))
}

/// Keep the sequences whose file stem is listed in `split_file`, sorted by
/// stem
pub fn filter_seqs<P: AsRef<Path>>(split_file: P, seqs: &[SeqEntry]) -> Result<Vec<SeqEntry>> {
    let split_file = split_file.as_ref();
    let content = std::fs::read_to_string(split_file)
        .with_context(|| format!("Failed to read split file {:?}", split_file))?;
    let wanted: HashSet<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let mut out: Vec<SeqEntry> = seqs
        .iter()
        .filter(|s| wanted.contains(s.name().as_str()))
        .cloned()
        .collect();
    out.sort_by_key(SeqEntry::name);
    Ok(out)
}

/// Frame labels per sequence stem
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeqLabels {
    /// Audio samples per label
    pub step: usize,
    /// Labels per sequence name
    pub labels: BTreeMap<String, Vec<u32>>,
}

impl SeqLabels {
    /// Labels every `step` samples
    pub fn new(step: usize, labels: BTreeMap<String, Vec<u32>>) -> Self {
        Self { step, labels }
    }

    /// Labels of one sequence
    pub fn get(&self, name: &str) -> Option<&[u32]> {
        self.labels.get(name).map(Vec::as_slice)
    }
}

/// Parse a label file of lines `name l1 l2 ...`.
///
/// Returns the labels and the number of classes (largest label + 1).
pub fn parse_seq_labels<P: AsRef<Path>>(path: P) -> Result<(SeqLabels, usize)> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read label file {:?}", path))?;
    let mut labels = BTreeMap::new();
    let mut max_label = 0u32;
    for (i, line) in content.lines().enumerate() {
        let mut fields = line.split_whitespace();
        let Some(name) = fields.next() else {
            continue;
        };
        let values = fields
            .map(|f| f.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Bad label on line {} of {:?}", i + 1, path))?;
        if let Some(&m) = values.iter().max() {
            max_label = max_label.max(m);
        }
        labels.insert(name.to_string(), values);
    }
    Ok((SeqLabels::new(LABEL_STEP, labels), max_label as usize + 1))
}
