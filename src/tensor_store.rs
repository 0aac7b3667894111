//! Hybrid memory/disk tensor store.
//!
//! A keyed container for the named intermediates of the response pipeline.
//! Each entry is either fully resident in memory or fully backed by one
//! dataset of a single HDF5 container file owned by the store. The backing
//! file is created at construction (a private temporary file unless an
//! explicit path is given) and the store assumes exclusive ownership of it
//! for its whole lifetime.

use crate::error::{PolarError, Result};
use hdf5_metno as hdf5;
use ndarray::prelude::*;
use ndarray::{ArrayD, ArrayViewD, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// A stored tensor: resident in process memory, or paged out to a dataset
/// of the backing file. Never partially both.
pub enum TensorEntry {
    Resident(ArrayD<f64>),
    Paged(hdf5::Dataset),
}

impl TensorEntry {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            TensorEntry::Resident(arr) => arr.shape().to_vec(),
            TensorEntry::Paged(ds) => ds.shape(),
        }
    }

    pub fn is_incore(&self) -> bool {
        matches!(self, TensorEntry::Resident(_))
    }
}

/// Serialized form of a resident tensor inside the checkpoint metadata blob.
#[derive(Serialize, Deserialize)]
struct MetaEntry {
    shape: Vec<usize>,
    data: Vec<f64>,
}

pub struct HybridStore {
    entries: HashMap<String, TensorEntry>,
    chkfile: hdf5::File,
    chkfile_name: PathBuf,
    // keeps the private backing file alive for the lifetime of the store
    _tmpdir: Option<tempfile::TempDir>,
}

impl HybridStore {
    /// Open a store backed by `path`, or by a private temporary file.
    pub fn new(path: Option<&Path>) -> Result<HybridStore> {
        let (chkfile_name, tmpdir) = match path {
            Some(p) => (p.to_path_buf(), None),
            None => {
                let tmpdir = tempfile::tempdir()?;
                (tmpdir.path().join("tensors.chk"), Some(tmpdir))
            }
        };
        let chkfile = hdf5::File::create(&chkfile_name)?;
        return Ok(HybridStore {
            entries: HashMap::new(),
            chkfile,
            chkfile_name,
            _tmpdir: tmpdir,
        });
    }

    /// Create the tensor `key`.
    ///
    /// Exactly one of `data` / `shape` must determine the extent. An
    /// existing key with a matching shape is zero-filled and reused in
    /// place (no new physical dataset); a mismatched shape is deleted and
    /// recreated. With `incore == false` the tensor lives in the backing
    /// file.
    pub fn create(
        &mut self,
        key: &str,
        data: Option<ArrayD<f64>>,
        incore: bool,
        shape: Option<&[usize]>,
    ) -> Result<()> {
        let req_shape: Vec<usize> = match (&data, shape) {
            (Some(arr), _) => arr.shape().to_vec(),
            (None, Some(s)) => s.to_vec(),
            (None, None) => {
                return Err(PolarError::Usage(format!(
                    "create(`{}`): neither data nor shape determines the extent",
                    key
                )))
            }
        };

        if let Some(entry) = self.entries.get_mut(key) {
            if entry.shape() == req_shape {
                match entry {
                    TensorEntry::Resident(arr) => match data {
                        Some(d) => *arr = d,
                        None => arr.fill(0.0),
                    },
                    TensorEntry::Paged(ds) => {
                        let d = data.unwrap_or_else(|| ArrayD::zeros(IxDyn(&req_shape)));
                        ds.write(&d)?;
                    }
                }
                return Ok(());
            }
            self.delete(key)?;
        }

        if !incore {
            // a resident key may shadow a like-named dataset after restore
            if self.chkfile.link_exists(key) {
                self.chkfile.unlink(key)?;
            }
            let ds = self
                .chkfile
                .new_dataset::<f64>()
                .shape(req_shape.clone())
                .create(key)?;
            if let Some(d) = data {
                ds.write(&d)?;
            }
            self.entries.insert(key.to_string(), TensorEntry::Paged(ds));
        } else {
            let arr = data.unwrap_or_else(|| ArrayD::zeros(IxDyn(&req_shape)));
            self.entries.insert(key.to_string(), TensorEntry::Resident(arr));
        }
        return Ok(());
    }

    /// Store `data` as an in-memory tensor under `key`.
    pub fn create_data(&mut self, key: &str, data: ArrayD<f64>) -> Result<()> {
        self.create(key, Some(data), true, None)
    }

    /// Allocate a zero-filled tensor of `shape` under `key`.
    pub fn create_zeros(&mut self, key: &str, shape: &[usize], incore: bool) -> Result<()> {
        self.create(key, None, incore, Some(shape))
    }

    /// Remove `key`. A paged entry also unlinks its dataset from the
    /// backing file; an already-unlinked dataset (removed through an
    /// aliasing key) is tolerated silently.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| PolarError::NotFound(key.to_string()))?;
        if let TensorEntry::Paged(_) = entry {
            if self.chkfile.link_exists(key) {
                self.chkfile.unlink(key)?;
            }
        }
        return Ok(());
    }

    /// Register `alias_key` referencing the same physical dataset as `key`
    /// (paged entries) or a copy of it (resident entries).
    pub fn alias(&mut self, key: &str, alias_key: &str) -> Result<()> {
        let entry = match self.get(key)? {
            TensorEntry::Paged(ds) => TensorEntry::Paged(ds.clone()),
            TensorEntry::Resident(arr) => TensorEntry::Resident(arr.clone()),
        };
        self.entries.insert(alias_key.to_string(), entry);
        return Ok(());
    }

    /// Materialize `key` fully in memory. Residency is not changed.
    pub fn load(&self, key: &str) -> Result<ArrayD<f64>> {
        match self.get(key)? {
            TensorEntry::Resident(arr) => Ok(arr.clone()),
            TensorEntry::Paged(ds) => Ok(ds.read_dyn::<f64>()?),
        }
    }

    /// [`load`](Self::load) with a fixed dimensionality.
    pub fn load_dim<D: Dimension>(&self, key: &str) -> Result<Array<f64, D>> {
        self.load(key)?.into_dimensionality::<D>().map_err(|e| {
            PolarError::Usage(format!("load(`{}`): unexpected rank: {}", key, e))
        })
    }

    /// Read rows `[start, stop)` along the leading axis.
    pub fn read_rows(&self, key: &str, start: usize, stop: usize) -> Result<ArrayD<f64>> {
        match self.get(key)? {
            TensorEntry::Resident(arr) => {
                Ok(arr.slice_axis(Axis(0), Slice::from(start..stop)).to_owned())
            }
            TensorEntry::Paged(ds) => {
                let arr: ArrayD<f64> = match ds.ndim() {
                    1 => ds.read_slice(s![start..stop])?,
                    2 => ds.read_slice(s![start..stop, ..])?,
                    3 => ds.read_slice(s![start..stop, .., ..])?,
                    4 => ds.read_slice(s![start..stop, .., .., ..])?,
                    n => {
                        return Err(PolarError::Usage(format!(
                            "read_rows(`{}`): rank-{} datasets unsupported",
                            key, n
                        )))
                    }
                };
                Ok(arr)
            }
        }
    }

    /// [`read_rows`](Self::read_rows) with a fixed dimensionality.
    pub fn read_rows_dim<D: Dimension>(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Array<f64, D>> {
        self.read_rows(key, start, stop)?
            .into_dimensionality::<D>()
            .map_err(|e| PolarError::Usage(format!("read_rows(`{}`): unexpected rank: {}", key, e)))
    }

    /// Write `block` into rows starting at `start` along the leading axis.
    pub fn write_rows(&mut self, key: &str, start: usize, block: ArrayViewD<f64>) -> Result<()> {
        let stop = start + block.shape()[0];
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| PolarError::NotFound(key.to_string()))?;
        match entry {
            TensorEntry::Resident(arr) => {
                arr.slice_axis_mut(Axis(0), Slice::from(start..stop)).assign(&block);
            }
            TensorEntry::Paged(ds) => match ds.ndim() {
                1 => ds.write_slice(block.view(), s![start..stop])?,
                2 => ds.write_slice(block.view(), s![start..stop, ..])?,
                3 => ds.write_slice(block.view(), s![start..stop, .., ..])?,
                4 => ds.write_slice(block.view(), s![start..stop, .., .., ..])?,
                n => {
                    return Err(PolarError::Usage(format!(
                        "write_rows(`{}`): rank-{} datasets unsupported",
                        key, n
                    )))
                }
            },
        }
        return Ok(());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn shape(&self, key: &str) -> Result<Vec<usize>> {
        Ok(self.get(key)?.shape())
    }

    pub fn is_incore(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_incore())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Path of the backing container file.
    pub fn chkfile_name(&self) -> &Path {
        &self.chkfile_name
    }

    /// Serialize the store: the backing container is copied to
    /// `dataset_path`, every purely-resident tensor goes into the
    /// `metadata_path` blob. Afterwards, keys that name a dataset in the
    /// backing file reference the canonical disk copy.
    pub fn checkpoint(&mut self, dataset_path: &Path, metadata_path: &Path) -> Result<()> {
        let mut blob: BTreeMap<String, MetaEntry> = BTreeMap::new();
        for (key, entry) in &self.entries {
            if let TensorEntry::Resident(arr) = entry {
                blob.insert(
                    key.clone(),
                    MetaEntry {
                        shape: arr.shape().to_vec(),
                        data: arr.iter().cloned().collect(),
                    },
                );
            }
        }
        let file = std::fs::File::create(metadata_path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &blob)?;

        // flush gives a consistent on-disk image; handles stay valid, so no
        // close/reopen cycle is needed around the copy
        self.chkfile.flush()?;
        std::fs::copy(&self.chkfile_name, dataset_path)?;

        for key in self.dataset_keys()? {
            let ds = self.chkfile.dataset(&key)?;
            self.entries.insert(key, TensorEntry::Paged(ds));
        }
        return Ok(());
    }

    /// Reconstruct a store from a checkpoint pair. The new store's private
    /// backing file is a copy of `dataset_path`; the copy happens before
    /// the HDF5 file is first opened, so no initial backing file is ever
    /// created and discarded.
    pub fn restore(dataset_path: &Path, metadata_path: &Path) -> Result<HybridStore> {
        let tmpdir = tempfile::tempdir()?;
        let chkfile_name = tmpdir.path().join("tensors.chk");
        std::fs::copy(dataset_path, &chkfile_name)?;
        let chkfile = hdf5::File::open_rw(&chkfile_name)?;
        let mut store = HybridStore {
            entries: HashMap::new(),
            chkfile,
            chkfile_name,
            _tmpdir: Some(tmpdir),
        };
        for key in store.dataset_keys()? {
            let ds = store.chkfile.dataset(&key)?;
            store.entries.insert(key, TensorEntry::Paged(ds));
        }

        let file = std::fs::File::open(metadata_path)?;
        let blob: BTreeMap<String, MetaEntry> =
            serde_json::from_reader(std::io::BufReader::new(file))?;
        for (key, meta) in blob {
            let arr = ArrayD::from_shape_vec(IxDyn(&meta.shape), meta.data)
                .map_err(|e| PolarError::Storage(e.to_string()))?;
            store.entries.insert(key, TensorEntry::Resident(arr));
        }
        return Ok(store);
    }

    fn get(&self, key: &str) -> Result<&TensorEntry> {
        self.entries
            .get(key)
            .ok_or_else(|| PolarError::NotFound(key.to_string()))
    }

    fn dataset_keys(&self) -> Result<Vec<String>> {
        let mut keys = vec![];
        for name in self.chkfile.member_names()? {
            if self.chkfile.dataset(&name).is_ok() {
                keys.push(name);
            }
        }
        return Ok(keys);
    }
}

#[cfg(test)]
mod debug {
    use super::*;
    use crate::utilities::gen_batch;

    fn lcg_fill(shape: &[usize], seed: u64) -> ArrayD<f64> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let n: usize = shape.iter().product();
        let data = (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
            })
            .collect();
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    #[test]
    fn test_create_idempotent_reuse() {
        let mut store = HybridStore::new(None).unwrap();
        store
            .create("t", Some(lcg_fill(&[4, 4], 1)), false, None)
            .unwrap();
        assert!(!store.is_incore("t").unwrap());
        // same shape: zero-filled in place, still one physical dataset
        store.create("t", None, false, Some(&[4, 4])).unwrap();
        let loaded = store.load("t").unwrap();
        assert!(loaded.iter().all(|&x| x == 0.0));
        assert_eq!(store.keys().len(), 1);

        // mismatched shape: deleted and recreated
        store.create("t", None, false, Some(&[2, 6])).unwrap();
        assert_eq!(store.shape("t").unwrap(), vec![2, 6]);
    }

    #[test]
    fn test_create_ambiguous_is_usage_error() {
        let mut store = HybridStore::new(None).unwrap();
        let err = store.create("x", None, true, None).unwrap_err();
        assert!(matches!(err, PolarError::Usage(_)));
    }

    #[test]
    fn test_missing_key_errors() {
        let mut store = HybridStore::new(None).unwrap();
        assert!(matches!(store.load("nope"), Err(PolarError::NotFound(_))));
        assert!(matches!(store.delete("nope"), Err(PolarError::NotFound(_))));
    }

    #[test]
    fn test_alias_delete_safety() {
        let mut store = HybridStore::new(None).unwrap();
        let data = lcg_fill(&[3, 5], 7);
        store.create("a", Some(data.clone()), false, None).unwrap();
        store.alias("a", "b").unwrap();

        // deleting the original unlinks the dataset; the alias handle must
        // still read the same content
        store.delete("a").unwrap();
        assert_eq!(store.load("b").unwrap(), data);
        store.delete("b").unwrap();

        store.create("c", Some(data.clone()), false, None).unwrap();
        store.alias("c", "d").unwrap();
        store.delete("d").unwrap();
        assert_eq!(store.load("c").unwrap(), data);
    }

    #[test]
    fn test_checkpoint_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let h5_path = dir.path().join("tensors.h5");
        let dat_path = dir.path().join("tensors.dat");

        let mut store = HybridStore::new(None).unwrap();
        let big = lcg_fill(&[6, 4, 4], 11);
        let small = lcg_fill(&[3, 3], 13);
        store.create("big", Some(big.clone()), false, None).unwrap();
        store.create("small", Some(small.clone()), true, None).unwrap();
        store.checkpoint(&h5_path, &dat_path).unwrap();

        // after checkpointing, the store stays usable
        assert_eq!(store.load("big").unwrap(), big);

        let restored = HybridStore::restore(&h5_path, &dat_path).unwrap();
        assert_eq!(restored.load("big").unwrap(), big);
        assert_eq!(restored.load("small").unwrap(), small);
        assert!(!restored.is_incore("big").unwrap());
        assert!(restored.is_incore("small").unwrap());
    }

    #[test]
    fn test_batched_processing_matches_unbatched() {
        // 4x4 tensor, dimension 0 chunked as [0,2), [2,4)
        let mut store = HybridStore::new(None).unwrap();
        let t = lcg_fill(&[4, 4], 17);
        store.create("T", Some(t.clone()), false, None).unwrap();
        store.create_zeros("out", &[4, 4], false).unwrap();

        let batches = gen_batch(0, 4, 2).unwrap();
        assert_eq!(batches, vec![0..2, 2..4]);
        for batch in batches {
            let block = store.read_rows("T", batch.start, batch.end).unwrap();
            store.write_rows("out", batch.start, (2.0 * &block).view()).unwrap();
        }
        let batched = store.load("out").unwrap();
        assert_eq!(batched, 2.0 * &t);
    }
}
