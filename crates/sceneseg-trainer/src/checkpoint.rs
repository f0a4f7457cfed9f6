//! Checkpoint snapshots of the parameter store.
//!
//! Each snapshot is `model-{step}.safetensors` carrying the parameters, the
//! optimizer moments and, in its header metadata, the global and optimizer
//! steps. `checkpoint.json` names the latest snapshot and the
//! retained history; it is replaced atomically after the snapshot is fully
//! written, so an interrupted save never leaves a dangling index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::optim::Adam;

pub const INDEX_FILE: &str = "checkpoint.json";
const STEP_KEY: &str = "global_step";
const OPTIMIZER_STEP_KEY: &str = "adam_step";
const PARTIAL_SUFFIX: &str = ".partial";

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub latest: String,
    pub step: u64,
    /// Retained snapshot file names, oldest first.
    pub history: Vec<String>,
}

/// Snapshot directory with bounded retention.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    keep: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep: crate::config::KEEP_CHECKPOINTS,
        }
    }

    /// Number of snapshots to retain; at least one.
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_name(step: u64) -> String {
        format!("model-{step}.safetensors")
    }

    /// Reads the index, if one exists.
    pub fn latest(&self) -> anyhow::Result<Option<CheckpointIndex>> {
        let path = self.dir.join(INDEX_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let index = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(index))
    }

    /// Writes every variable in `varmap`, plus the optimizer state when
    /// given, as the snapshot for `step`.
    pub fn save(
        &self,
        varmap: &VarMap,
        optimizer: Option<&Adam>,
        step: u64,
    ) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let mut tensors: Vec<(String, Tensor)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("parameter store lock poisoned"))?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };
        let mut metadata = HashMap::from([(STEP_KEY.to_string(), step.to_string())]);
        if let Some(optimizer) = optimizer {
            tensors.extend(optimizer.state_tensors());
            metadata.insert(
                OPTIMIZER_STEP_KEY.to_string(),
                optimizer.step_count().to_string(),
            );
        }
        tensors.sort_by(|a, b| a.0.cmp(&b.0));

        let name = Self::snapshot_name(step);
        let path = self.dir.join(&name);
        let partial = self.dir.join(format!("{name}{PARTIAL_SUFFIX}"));
        safetensors::serialize_to_file(tensors, &Some(metadata), &partial)
            .with_context(|| format!("writing {}", partial.display()))?;
        std::fs::rename(&partial, &path)
            .with_context(|| format!("moving snapshot into {}", path.display()))?;

        let mut index = self.latest()?.unwrap_or_default();
        index.history.retain(|h| h != &name);
        index.history.push(name.clone());
        index.latest = name;
        index.step = step;
        let pruned = self.prune(&mut index);
        self.write_index(&index)?;
        for stale in pruned {
            let stale_path = self.dir.join(&stale);
            if let Err(e) = std::fs::remove_file(&stale_path) {
                debug!(path = %stale_path.display(), error = %e, "could not remove old snapshot");
            }
        }

        info!(step, path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    /// Loads the latest snapshot into `varmap`, and into `optimizer` when
    /// given, and returns its step, or `None` when the directory holds no
    /// checkpoint.
    ///
    /// Every variable in `varmap` must be present in the snapshot.
    pub fn restore(
        &self,
        varmap: &mut VarMap,
        optimizer: Option<&mut Adam>,
    ) -> anyhow::Result<Option<u64>> {
        let Some(index) = self.latest()? else {
            return Ok(None);
        };
        let path = self.dir.join(&index.latest);
        varmap
            .load(&path)
            .with_context(|| format!("restoring {}", path.display()))?;
        let metadata = snapshot_metadata(&path)?;
        let step = parse_key(&metadata, STEP_KEY).unwrap_or(index.step);
        if let Some(optimizer) = optimizer {
            let tensors = candle_core::safetensors::load(&path, &Device::Cpu)
                .with_context(|| format!("reading optimizer state from {}", path.display()))?;
            let optimizer_step = parse_key(&metadata, OPTIMIZER_STEP_KEY).unwrap_or(step);
            optimizer.load_state(&tensors, optimizer_step)?;
        }
        info!(step, path = %path.display(), "model restored");
        Ok(Some(step))
    }

    fn prune(&self, index: &mut CheckpointIndex) -> Vec<String> {
        let excess = index.history.len().saturating_sub(self.keep);
        index.history.drain(..excess).collect()
    }

    fn write_index(&self, index: &CheckpointIndex) -> anyhow::Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let tmp = self.dir.join(format!("{INDEX_FILE}{PARTIAL_SUFFIX}"));
        std::fs::write(&tmp, serde_json::to_string_pretty(index)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

/// Reads the step recorded in a snapshot header.
pub fn snapshot_step(path: &Path) -> anyhow::Result<Option<u64>> {
    Ok(parse_key(&snapshot_metadata(path)?, STEP_KEY))
}

fn snapshot_metadata(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let (_, metadata) = safetensors::SafeTensors::read_metadata(&bytes)
        .with_context(|| format!("parsing header of {}", path.display()))?;
    Ok(metadata.metadata().clone().unwrap_or_default())
}

fn parse_key(metadata: &HashMap<String, String>, key: &str) -> Option<u64> {
    metadata.get(key).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::Init;

    fn varmap_with(value: f64) -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 3), "conv.weight", Init::Const(value), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
            .get(3, "conv.bias", Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    fn weight(varmap: &VarMap) -> Vec<Vec<f32>> {
        let data = varmap.data().lock().unwrap();
        data["conv.weight"].as_tensor().to_vec2().unwrap()
    }

    #[test]
    fn empty_store_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut varmap = varmap_with(1.0);
        assert!(store.latest().unwrap().is_none());
        assert_eq!(store.restore(&mut varmap, None).unwrap(), None);
    }

    #[test]
    fn save_then_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.save(&varmap_with(2.0), None, 300).unwrap();
        assert!(path.ends_with("model-300.safetensors"));
        assert_eq!(snapshot_step(&path).unwrap(), Some(300));

        let mut fresh = varmap_with(0.0);
        assert_eq!(store.restore(&mut fresh, None).unwrap(), Some(300));
        assert_eq!(weight(&fresh), vec![vec![2.0; 3]; 2]);
        assert!(!dir.path().join(format!("{INDEX_FILE}{PARTIAL_SUFFIX}")).exists());
    }

    #[test]
    fn retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).with_keep(2);
        let varmap = varmap_with(1.0);
        for step in [100, 200, 300] {
            store.save(&varmap, None, step).unwrap();
        }
        let index = store.latest().unwrap().unwrap();
        assert_eq!(index.latest, "model-300.safetensors");
        assert_eq!(index.step, 300);
        assert_eq!(index.history, vec!["model-200.safetensors", "model-300.safetensors"]);
        assert!(!dir.path().join("model-100.safetensors").exists());
        assert!(dir.path().join("model-200.safetensors").exists());
    }

    #[test]
    fn resaving_same_step_keeps_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).with_keep(3);
        let varmap = varmap_with(1.0);
        store.save(&varmap, None, 100).unwrap();
        store.save(&varmap, None, 100).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().history.len(), 1);
    }

    #[test]
    fn restore_fails_on_missing_variable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&varmap_with(1.0), None, 10).unwrap();

        let mut bigger = varmap_with(0.0);
        bigger
            .get(4, "extra.bias", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        assert!(store.restore(&mut bigger, None).is_err());
    }

    #[test]
    fn interrupted_save_keeps_last_good_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&varmap_with(2.0), None, 100).unwrap();

        // A save for step 200 that died before either rename.
        let stale_snapshot = dir.path().join("model-200.safetensors.partial");
        let stale_index = dir.path().join(format!("{INDEX_FILE}{PARTIAL_SUFFIX}"));
        std::fs::write(&stale_snapshot, b"half a header").unwrap();
        std::fs::write(&stale_index, br#"{"latest": "model-2"#).unwrap();

        let mut fresh = varmap_with(0.0);
        assert_eq!(store.restore(&mut fresh, None).unwrap(), Some(100));
        assert_eq!(weight(&fresh), vec![vec![2.0; 3]; 2]);
        assert_eq!(store.latest().unwrap().unwrap().latest, "model-100.safetensors");

        // The next save replaces the leftovers.
        store.save(&varmap_with(3.0), None, 200).unwrap();
        assert!(!stale_snapshot.exists());
        assert!(!stale_index.exists());
        assert_eq!(store.restore(&mut fresh, None).unwrap(), Some(200));
        assert_eq!(weight(&fresh), vec![vec![3.0; 3]; 2]);
    }

    #[test]
    fn optimizer_state_travels_with_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let params = candle_nn::ParamsAdamW {
            weight_decay: 0.0,
            ..Default::default()
        };
        let varmap = varmap_with(1.0);
        let mut adam = Adam::from_varmap(&varmap, params.clone()).unwrap();
        let loss = varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().sqr().unwrap().sum_all().unwrap())
            .reduce(|a, b| (a + b).unwrap())
            .unwrap();
        candle_nn::Optimizer::backward_step(&mut adam, &loss).unwrap();
        let path = store.save(&varmap, Some(&adam), 1).unwrap();
        let names = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert!(names.contains_key("adam.m.conv.weight"));
        assert!(names.contains_key("adam.v.conv.bias"));

        let mut restored_map = varmap_with(0.0);
        let mut restored = Adam::from_varmap(&restored_map, params).unwrap();
        let step = store.restore(&mut restored_map, Some(&mut restored)).unwrap();
        assert_eq!(step, Some(1));
        assert_eq!(restored.step_count(), 1);
        let ours: HashMap<String, Tensor> = adam.state_tensors().into_iter().collect();
        let theirs: HashMap<String, Tensor> = restored.state_tensors().into_iter().collect();
        for (name, tensor) in &ours {
            let a: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = theirs[name].flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(a, b, "{name}");
        }
    }
}
