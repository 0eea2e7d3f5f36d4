use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaptionError, CaptionResult};
use crate::layers::param::Param;
use crate::math::matrix::Matrix;

/// Progress counters persisted with every checkpoint.
///
/// `global_step` is the primary optimizer's update count; a resumed run keeps
/// counting from it so annealing never restarts at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: u64,
    pub epochs_completed: usize,
}

/// Snapshot of the selected parameters and the training state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub state: TrainingState,
    pub params: BTreeMap<String, Matrix>,
}

impl CheckpointRecord {
    pub fn capture<'a>(state: TrainingState, params: impl IntoIterator<Item = &'a Param>) -> CheckpointRecord {
        let params = params
            .into_iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        CheckpointRecord { state, params }
    }

    /// Copies the recorded values into `params`. Every param must be present
    /// with a matching shape; extra entries in the record are ignored.
    pub fn apply_to<'a>(&self, params: impl IntoIterator<Item = &'a mut Param>) -> CaptionResult<()> {
        for param in params {
            let value = self.params.get(&param.name).ok_or_else(|| {
                CaptionError::config(format!("checkpoint lacks parameter '{}'", param.name))
            })?;
            if value.shape() != param.value.shape() || !value.is_well_formed() {
                return Err(CaptionError::config(format!(
                    "checkpoint parameter '{}' has shape {:?}, model expects {:?}",
                    param.name,
                    value.shape(),
                    param.value.shape()
                )));
            }
            param.value = value.clone();
            param.zero_grad();
        }
        Ok(())
    }
}

/// Name-keyed checkpoint slots under one directory. Saving under an existing
/// name replaces the previous record.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> CheckpointStore {
        CheckpointStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.ckpt.json"))
    }

    /// Writes to a sibling temp file first and renames it over the slot, so
    /// an interrupted save leaves the previous record intact.
    pub fn save(&self, name: &str, record: &CheckpointRecord) -> CaptionResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        let tmp = self.dir.join(format!("{name}.ckpt.json.tmp"));
        if let Err(e) = write_record(&tmp, record) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), params = record.params.len(), "checkpoint written");
        Ok(path)
    }

    pub fn load(&self, name: &str) -> CaptionResult<CheckpointRecord> {
        let path = self.path_for(name);
        let file = fs::File::open(&path).map_err(|e| {
            CaptionError::resource(format!("cannot open checkpoint '{}': {e}", path.display()))
        })?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Serializes `record` to `path` and syncs it to disk. Flush errors surface
/// here instead of being dropped with the writer.
fn write_record(path: &Path, record: &CheckpointRecord) -> CaptionResult<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer(&mut writer, record)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str, v: f64) -> Param {
        Param::new(name, Matrix::filled(2, 2, v), true)
    }

    #[test]
    fn save_overwrites_and_load_restores() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        let a = param("a", 1.0);

        let first = CheckpointRecord::capture(TrainingState { global_step: 3, epochs_completed: 1 }, [&a]);
        store.save("run", &first).unwrap();
        let b = param("a", 2.0);
        let second = CheckpointRecord::capture(TrainingState { global_step: 7, epochs_completed: 2 }, [&b]);
        store.save("run", &second).unwrap();

        let loaded = store.load("run").unwrap();
        assert_eq!(loaded.state.global_step, 7);
        let mut target = param("a", 0.0);
        loaded.apply_to([&mut target]).unwrap();
        assert_eq!(target.value, Matrix::filled(2, 2, 2.0));

        let files: Vec<_> = fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn missing_checkpoint_is_a_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(matches!(store.load("absent"), Err(CaptionError::Resource(_))));
    }

    #[test]
    fn apply_rejects_missing_or_misshapen_params() {
        let record = CheckpointRecord::capture(TrainingState::default(), [&param("a", 1.0)]);
        let mut other = param("b", 0.0);
        assert!(matches!(record.apply_to([&mut other]), Err(CaptionError::Configuration(_))));

        let mut wrong = Param::new("a", Matrix::zeros(1, 3), true);
        assert!(matches!(record.apply_to([&mut wrong]), Err(CaptionError::Configuration(_))));

        let mut corrupt = record.clone();
        if let Some(m) = corrupt.params.get_mut("a") {
            m.data[1].pop();
        }
        let mut target = param("a", 0.0);
        assert!(corrupt.apply_to([&mut target]).is_err());
        assert_eq!(target.value, Matrix::filled(2, 2, 0.0));
    }

    #[test]
    fn save_restore_is_bit_exact() {
        use rand::{rngs::StdRng, SeedableRng};

        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut rng = StdRng::seed_from_u64(17);
        let original = Param::new("w", Matrix::xavier(16, 16, &mut rng), true);
        store
            .save("exact", &CheckpointRecord::capture(TrainingState::default(), [&original]))
            .unwrap();

        let mut restored = Param::new("w", Matrix::zeros(16, 16), true);
        store.load("exact").unwrap().apply_to([&mut restored]).unwrap();
        let changed = original
            .value
            .data
            .iter()
            .flatten()
            .zip(restored.value.data.iter().flatten())
            .filter(|(a, b)| a.to_bits() != b.to_bits())
            .count();
        assert_eq!(changed, 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_write_is_reported() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let record = CheckpointRecord::capture(TrainingState::default(), [&param("a", 1.0)]);
        assert!(matches!(write_record(full, &record), Err(CaptionError::Io(_))));
    }
}
