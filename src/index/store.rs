//! Feature shard files and the in-memory feature store.
//!
//! Shards are read with memory mapping and concatenated in ascending
//! numeric order into one dense row-major matrix, so row order (and
//! therefore every index computed against it, including the cluster seed
//! cache) is reproducible across runs.
//!
//! # Shard Format
//!
//! Little-endian binary, one file per shard:
//! - Header (16 bytes): magic `LKSH`, format version, vector count, dimension
//! - Records: u16 ID byte-length, UTF-8 ID bytes, `dimension` f32 values
//!
//! A truncated file, trailing bytes, or a dimension disagreement between
//! shards is a fatal startup error, never silently tolerated.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;
use tracing::info;

use crate::index::types::{IndexError, IndexResult, ProductId, VectorDimension};

/// Current shard format version.
const SHARD_VERSION: u32 = 1;

/// Size of the shard header in bytes.
const HEADER_SIZE: usize = 16;

/// Magic bytes identifying feature shard files.
const MAGIC_BYTES: &[u8; 4] = b"LKSH";

/// Number of bytes per f32 value.
const BYTES_PER_F32: usize = 4;

/// File extension of feature shards.
const SHARD_EXTENSION: &str = "shard";

/// Norms below this are treated as zero; the row is left un-normalized.
const NORM_EPSILON: f32 = 1e-12;

/// Immutable store of L2-normalized feature vectors with a parallel ID list.
///
/// Created once at startup and never mutated afterwards, so it can be
/// shared across request tasks without synchronization. Row `i` of the
/// matrix corresponds to `ids()[i]`.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    ids: Vec<ProductId>,
    id_rows: HashMap<ProductId, usize>,
    data: Vec<f32>,
    dimension: VectorDimension,
    /// Squared L2 norm per row, precomputed once so queries can use
    /// ‖a−b‖² = ‖a‖² + ‖b‖² − 2a·b without touching the norms again.
    sq_norms: Vec<f32>,
}

impl FeatureStore {
    /// Loads every shard in `dir`, ascending by shard number.
    ///
    /// Shards must be named `0.shard`, `1.shard`, ... with no gaps; a
    /// missing or corrupt shard aborts the load. Rows are L2-normalized
    /// after concatenation.
    pub fn load(dir: impl AsRef<Path>) -> IndexResult<Self> {
        let dir = dir.as_ref();
        let shard_paths = Self::shard_paths(dir)?;

        info!(dir = %dir.display(), shards = shard_paths.len(), "loading feature shards");

        let mut entries = Vec::new();
        for path in &shard_paths {
            entries.extend(read_shard(path)?);
        }

        let store = Self::from_parts(entries)?;
        info!(
            vectors = store.len(),
            dimension = %store.dimension(),
            "feature matrix ready"
        );
        Ok(store)
    }

    /// Builds a store from `(id, vector)` pairs, normalizing each vector.
    ///
    /// This is the canonical constructor: shard loading, whitelist
    /// filtering, and prototype tables all funnel through it so the
    /// normalization invariant holds everywhere.
    pub fn from_parts(entries: Vec<(ProductId, Vec<f32>)>) -> IndexResult<Self> {
        let Some((_, first)) = entries.first() else {
            return Err(IndexError::InvalidDimension {
                dimension: 0,
                reason: "cannot build a feature store from zero vectors",
            });
        };
        let dimension = VectorDimension::new(first.len())?;

        let mut ids = Vec::with_capacity(entries.len());
        let mut data = Vec::with_capacity(entries.len() * dimension.get());
        for (id, vector) in entries {
            dimension.validate_vector(&vector)?;
            ids.push(id);
            data.extend_from_slice(&vector);
        }

        for row in data.chunks_exact_mut(dimension.get()) {
            normalize_row(row);
        }

        let sq_norms = data
            .chunks_exact(dimension.get())
            .map(|row| row.iter().map(|x| x * x).sum())
            .collect();

        let id_rows = ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.clone(), row))
            .collect();

        Ok(Self {
            ids,
            id_rows,
            data,
            dimension,
            sq_norms,
        })
    }

    /// Returns a new store containing only rows whose ID is in `whitelist`,
    /// relative order preserved.
    pub fn filter_by_whitelist(&self, whitelist: &HashSet<ProductId>) -> IndexResult<Self> {
        let entries: Vec<(ProductId, Vec<f32>)> = self
            .ids
            .iter()
            .enumerate()
            .filter(|(_, id)| whitelist.contains(id))
            .map(|(row, id)| (id.clone(), self.row(row).to_vec()))
            .collect();
        let kept = entries.len();
        let store = Self::from_parts(entries)?;
        info!(kept, total = self.len(), "applied whitelist filter");
        Ok(store)
    }

    /// Number of vectors in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The vector dimension shared by every row.
    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    /// The ID list, parallel to the matrix rows.
    #[must_use]
    pub fn ids(&self) -> &[ProductId] {
        &self.ids
    }

    /// ID of the vector at `row`.
    #[must_use]
    pub fn id(&self, row: usize) -> &ProductId {
        &self.ids[row]
    }

    /// Row index of `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: &ProductId) -> Option<usize> {
        self.id_rows.get(id).copied()
    }

    /// The normalized vector at `row`.
    #[must_use]
    pub fn row(&self, row: usize) -> &[f32] {
        let dim = self.dimension.get();
        &self.data[row * dim..(row + 1) * dim]
    }

    /// Precomputed squared L2 norms, one per row.
    #[must_use]
    pub fn sq_norms(&self) -> &[f32] {
        &self.sq_norms
    }

    /// Collects shard paths in `dir`, validating contiguous numbering.
    fn shard_paths(dir: &Path) -> IndexResult<Vec<PathBuf>> {
        let reader = std::fs::read_dir(dir).map_err(|source| IndexError::ShardRead {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut numbered = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|source| IndexError::ShardRead {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SHARD_EXTENSION) {
                continue;
            }
            let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<usize>().ok())
            else {
                continue;
            };
            numbered.push((index, path));
        }

        if numbered.is_empty() {
            return Err(IndexError::NoShards {
                dir: dir.to_path_buf(),
            });
        }

        numbered.sort_by_key(|(index, _)| *index);
        for (expected, (actual, _)) in numbered.iter().enumerate() {
            if *actual != expected {
                return Err(IndexError::MissingShard {
                    dir: dir.to_path_buf(),
                    index: expected,
                });
            }
        }

        Ok(numbered.into_iter().map(|(_, path)| path).collect())
    }
}

/// Reads one shard file into `(id, raw vector)` pairs.
///
/// Vectors are returned raw; normalization happens when they enter a
/// [`FeatureStore`].
pub fn read_shard(path: impl AsRef<Path>) -> IndexResult<Vec<(ProductId, Vec<f32>)>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| IndexError::ShardRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mmap = unsafe {
        MmapOptions::new()
            .map(&file)
            .map_err(|source| IndexError::ShardRead {
                path: path.to_path_buf(),
                source,
            })?
    };

    let format_err = |reason: &str| IndexError::ShardFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if mmap.len() < HEADER_SIZE {
        return Err(format_err("file too small to contain header"));
    }
    if &mmap[0..4] != MAGIC_BYTES {
        return Err(format_err("invalid magic bytes"));
    }
    let version = u32::from_le_bytes([mmap[4], mmap[5], mmap[6], mmap[7]]);
    if version != SHARD_VERSION {
        return Err(format_err(&format!(
            "unsupported shard version {version} (expected {SHARD_VERSION})"
        )));
    }
    let count = u32::from_le_bytes([mmap[8], mmap[9], mmap[10], mmap[11]]) as usize;
    let dim = u32::from_le_bytes([mmap[12], mmap[13], mmap[14], mmap[15]]) as usize;
    if dim == 0 {
        return Err(format_err("zero vector dimension in header"));
    }

    let mut entries = Vec::with_capacity(count);
    let mut offset = HEADER_SIZE;
    for record in 0..count {
        if offset + 2 > mmap.len() {
            return Err(format_err(&format!("truncated at record {record}")));
        }
        let id_len = u16::from_le_bytes([mmap[offset], mmap[offset + 1]]) as usize;
        offset += 2;

        let vector_bytes = dim * BYTES_PER_F32;
        if offset + id_len + vector_bytes > mmap.len() {
            return Err(format_err(&format!("truncated at record {record}")));
        }

        let id = std::str::from_utf8(&mmap[offset..offset + id_len])
            .map_err(|_| format_err(&format!("non-UTF-8 ID at record {record}")))?;
        offset += id_len;

        let mut vector = Vec::with_capacity(dim);
        for chunk in mmap[offset..offset + vector_bytes].chunks_exact(BYTES_PER_F32) {
            vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        offset += vector_bytes;

        entries.push((ProductId::new(id), vector));
    }

    if offset != mmap.len() {
        return Err(format_err("trailing bytes after final record"));
    }

    Ok(entries)
}

/// Writes `(id, vector)` pairs as one shard file.
///
/// Counterpart of [`read_shard`], used by the exporter tooling and tests.
pub fn write_shard(
    path: impl AsRef<Path>,
    entries: &[(ProductId, Vec<f32>)],
) -> IndexResult<()> {
    let path = path.as_ref();
    let dim = entries.first().map(|(_, v)| v.len()).unwrap_or(0);
    let dimension = VectorDimension::new(dim)?;

    let io_err = |source: std::io::Error| IndexError::ShardRead {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(MAGIC_BYTES).map_err(io_err)?;
    file.write_all(&SHARD_VERSION.to_le_bytes()).map_err(io_err)?;
    file.write_all(&(entries.len() as u32).to_le_bytes())
        .map_err(io_err)?;
    file.write_all(&(dim as u32).to_le_bytes()).map_err(io_err)?;

    for (id, vector) in entries {
        dimension.validate_vector(vector)?;
        file.write_all(&(id.as_str().len() as u16).to_le_bytes())
            .map_err(io_err)?;
        file.write_all(id.as_str().as_bytes()).map_err(io_err)?;
        for &value in vector {
            file.write_all(&value.to_le_bytes()).map_err(io_err)?;
        }
    }

    file.flush().map_err(io_err)?;
    Ok(())
}

/// Divides a row by its Euclidean norm in place.
///
/// Rows with a vanishing norm are left untouched rather than producing
/// NaN entries.
fn normalize_row(row: &mut [f32]) {
    let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > NORM_EPSILON {
        for value in row.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entries() -> Vec<(ProductId, Vec<f32>)> {
        vec![
            (ProductId::new("a"), vec![3.0, 4.0, 0.0]),
            (ProductId::new("b"), vec![0.0, 5.0, 0.0]),
            (ProductId::new("c"), vec![1.0, 1.0, 1.0]),
        ]
    }

    #[test]
    fn test_shard_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.shard");

        let entries = sample_entries();
        write_shard(&path, &entries).unwrap();

        let read = read_shard(&path).unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_load_concatenates_shards_in_order() {
        let dir = TempDir::new().unwrap();
        // Written out of order on purpose; load must go by shard number.
        write_shard(
            dir.path().join("1.shard"),
            &[(ProductId::new("later"), vec![0.0, 1.0])],
        )
        .unwrap();
        write_shard(
            dir.path().join("0.shard"),
            &[(ProductId::new("earlier"), vec![1.0, 0.0])],
        )
        .unwrap();

        let store = FeatureStore::load(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.id(0).as_str(), "earlier");
        assert_eq!(store.id(1).as_str(), "later");
        assert_eq!(store.index_of(&ProductId::new("later")), Some(1));
    }

    #[test]
    fn test_load_rejects_missing_shard() {
        let dir = TempDir::new().unwrap();
        write_shard(
            dir.path().join("0.shard"),
            &[(ProductId::new("a"), vec![1.0, 0.0])],
        )
        .unwrap();
        write_shard(
            dir.path().join("2.shard"),
            &[(ProductId::new("b"), vec![0.0, 1.0])],
        )
        .unwrap();

        let err = FeatureStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, IndexError::MissingShard { index: 1, .. }));
    }

    #[test]
    fn test_load_rejects_empty_dir() {
        let dir = TempDir::new().unwrap();
        let err = FeatureStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, IndexError::NoShards { .. }));
    }

    #[test]
    fn test_corrupt_shard_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.shard");
        std::fs::write(&path, b"not a shard").unwrap();

        let err = read_shard(&path).unwrap_err();
        assert!(matches!(err, IndexError::ShardFormat { .. }));
    }

    #[test]
    fn test_truncated_shard_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.shard");
        write_shard(&path, &sample_entries()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = read_shard(&path).unwrap_err();
        assert!(matches!(err, IndexError::ShardFormat { .. }));
    }

    #[test]
    fn test_rows_are_normalized() {
        let store = FeatureStore::from_parts(sample_entries()).unwrap();
        for row in 0..store.len() {
            let norm: f32 = store.row(row).iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6, "row {row} has norm {norm}");
        }
        // Precomputed squared norms match the invariant.
        for &sq in store.sq_norms() {
            assert!((sq - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_zero_vector_stays_finite() {
        let store = FeatureStore::from_parts(vec![
            (ProductId::new("zero"), vec![0.0, 0.0]),
            (ProductId::new("unit"), vec![1.0, 0.0]),
        ])
        .unwrap();
        assert!(store.row(0).iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_whitelist_filter_preserves_order() {
        let store = FeatureStore::from_parts(sample_entries()).unwrap();
        let whitelist: HashSet<ProductId> =
            [ProductId::new("c"), ProductId::new("a")].into_iter().collect();

        let filtered = store.filter_by_whitelist(&whitelist).unwrap();
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.id(0).as_str(), "a");
        assert_eq!(filtered.id(1).as_str(), "c");
        assert!(filtered.index_of(&ProductId::new("b")).is_none());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let err = FeatureStore::from_parts(vec![
            (ProductId::new("a"), vec![1.0, 0.0]),
            (ProductId::new("b"), vec![1.0, 0.0, 0.0]),
        ])
        .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
    }
}
