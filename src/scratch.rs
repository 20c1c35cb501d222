//! Disk-backed block store.
//!
//! Every dataset is one `.npy` file under the store's root directory. Groups are
//! sub-directories; a scatter-write places each transposed column chunk in its own file named
//! `<tag>.<chunk>.npy`, so that a later pass can gather arbitrary row ranges of the transposed
//! layout without holding the full tensor.

use crate::prelude::*;
use itertools::Itertools;
use npyz::WriterBuilder;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/* #region npy dataset */

/// A c-contiguous f64 `.npy` file addressed by leading-axis rows.
#[derive(Debug, Clone)]
pub struct NpyTensor {
    pub path: PathBuf,
    pub shape: Vec<usize>,
}

fn write_npy(path: &Path, shape: &[usize], data: impl IntoIterator<Item = f64>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    let shape_u64 = shape.iter().map(|&x| x as u64).collect::<Vec<u64>>();
    let mut writer = npyz::WriteOptions::new().default_dtype().shape(&shape_u64).writer(BufWriter::new(file)).begin_nd()?;
    writer.extend(data)?;
    writer.finish()?;
    Ok(())
}

impl NpyTensor {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let shape = util::npy_shape(&path)?;
        Ok(Self { path, shape })
    }

    /// Create a zero-filled dataset.
    pub fn create_zeros(path: impl Into<PathBuf>, shape: &[usize]) -> Result<Self> {
        let path = path.into();
        let size = shape.iter().product::<usize>();
        write_npy(&path, shape, std::iter::repeat_n(0.0, size))?;
        Ok(Self { path, shape: shape.to_vec() })
    }

    /// Create a dataset holding `data`.
    pub fn create_from(path: impl Into<PathBuf>, data: &TsrView) -> Result<Self> {
        let path = path.into();
        let shape = data.shape().to_vec();
        write_npy(&path, &shape, util::to_c_vec(data))?;
        Ok(Self { path, shape })
    }

    pub fn nrow(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Number of elements in one leading-axis row.
    pub fn row_size(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    fn reader(&self) -> Result<npyz::NpyReader<f64, BufReader<File>>> {
        let file = File::open(&self.path).with_context(|| format!("cannot open {}", self.path.display()))?;
        let npy = npyz::NpyFile::new(BufReader::new(file))?;
        Ok(npy.data::<f64>()?)
    }

    /// Leading-axis rows `[p0, p1)`, shape `(p1 - p0, shape[1..])`.
    pub fn read_rows(&self, p0: usize, p1: usize, device: &DeviceTsr) -> Result<Tsr> {
        self.read_row_ranges(&[(p0, p1)], device)
    }

    /// Several row ranges through a single open reader, stacked in the given order.
    pub fn read_row_ranges(&self, ranges: &[(usize, usize)], device: &DeviceTsr) -> Result<Tsr> {
        let row_size = self.row_size();
        let nrow = ranges.iter().map(|(p0, p1)| p1.saturating_sub(*p0)).sum::<usize>();
        let mut reader = self.reader()?;
        let mut data = Vec::with_capacity(nrow * row_size);
        for &(p0, p1) in ranges {
            assert!(p0 <= p1 && p1 <= self.nrow(), "rows {p0}..{p1} out of bounds for {:?} in {}", self.shape, self.path.display());
            reader.seek_to((p0 * row_size) as u64)?;
            for x in reader.by_ref().take((p1 - p0) * row_size) {
                data.push(x?);
            }
        }
        ensure!(data.len() == nrow * row_size, "unexpected end of npy data in {}", self.path.display());
        let mut shape = self.shape.clone();
        shape[0] = nrow;
        Ok(util::asarray_c(data, &shape, device))
    }

    /// Second-axis slice `[c0, c1)` over all leading rows, shape `(shape[0], c1 - c0, shape[2..])`.
    pub fn read_cols(&self, c0: usize, c1: usize, device: &DeviceTsr) -> Result<Tsr> {
        assert!(self.shape.len() >= 2, "column read needs at least two axes, got {:?}", self.shape);
        assert!(c0 <= c1 && c1 <= self.shape[1], "cols {c0}..{c1} out of bounds for {:?} in {}", self.shape, self.path.display());
        let row_size = self.row_size();
        let inner = self.shape.iter().skip(2).product::<usize>();
        let mut reader = self.reader()?;
        let mut data = Vec::with_capacity(self.nrow() * (c1 - c0) * inner);
        for r in 0..self.nrow() {
            reader.seek_to((r * row_size + c0 * inner) as u64)?;
            for _ in 0..(c1 - c0) * inner {
                data.push(reader.next().context("unexpected end of npy data")??);
            }
        }
        let mut shape = self.shape.clone();
        shape[1] = c1 - c0;
        Ok(util::asarray_c(data, &shape, device))
    }

    pub fn read_all(&self, device: &DeviceTsr) -> Result<Tsr> {
        self.read_rows(0, self.nrow(), device)
    }

    /// Overwrite leading-axis rows starting at `p0` in place.
    pub fn write_rows(&self, p0: usize, block: &TsrView) -> Result<()> {
        let row_size = self.row_size();
        let nrow_blk = if row_size == 0 { 0 } else { block.size() / row_size };
        assert!(
            block.shape().iter().skip(1).product::<usize>() == row_size && p0 + nrow_blk <= self.nrow(),
            "block {:?} at row {p0} does not fit dataset {:?}",
            block.shape(),
            self.shape
        );
        let total = self.shape.iter().product::<usize>() as u64;
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        let header_len = file.metadata()?.len() - total * 8;
        file.seek(SeekFrom::Start(header_len + (p0 * row_size * 8) as u64))?;
        let bytes = util::to_c_vec(block).into_iter().flat_map(f64::to_le_bytes).collect::<Vec<u8>>();
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }
}

/* #endregion */

/* #region scratch store */

/// Scratch container scoped to one computation.
#[derive(Debug)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    /// Create a fresh, uniquely named directory under `parent` (system temp dir by default).
    pub fn create(parent: Option<&Path>, prefix: &str) -> Result<Self> {
        let parent = parent.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
        let count = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = parent.join(format!("{prefix}-{}-{count}", std::process::id()));
        std::fs::create_dir_all(&root).with_context(|| format!("cannot create scratch {}", root.display()))?;
        debug!("scratch store created at {}", root.display());
        Ok(Self { root })
    }

    /// Use `root` as the store directory, creating it if needed. Nothing is removed implicitly.
    pub fn open_at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).with_context(|| format!("cannot create store {}", root.display()))?;
        Ok(Self { root })
    }

    /// Run `f` with a fresh store, removing it afterwards whether `f` succeeds or fails.
    pub fn scoped<R>(parent: Option<&Path>, prefix: &str, f: impl FnOnce(&ScratchStore) -> Result<R>) -> Result<R> {
        let store = Self::create(parent, prefix)?;
        let result = f(&store);
        let cleanup = store.remove();
        let out = result?;
        cleanup?;
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.npy"))
    }

    pub fn create_dataset(&self, key: &str, shape: &[usize]) -> Result<NpyTensor> {
        NpyTensor::create_zeros(self.key_path(key), shape)
    }

    pub fn write_dataset(&self, key: &str, data: &TsrView) -> Result<NpyTensor> {
        NpyTensor::create_from(self.key_path(key), data)
    }

    pub fn open_dataset(&self, key: &str) -> Result<NpyTensor> {
        NpyTensor::open(self.key_path(key))
    }

    /// Scatter-write: store `block (nrow, ncol)` transposed, in chunks of `column_chunk` columns.
    ///
    /// Chunk `k` holds `block[:, k*c..(k+1)*c].T` as entry `<group>/<tag>.<k>`.
    pub fn transpose_to_group(&self, group: &str, tag: usize, block: &TsrView, column_chunk: usize) -> Result<()> {
        assert_eq!(block.shape().len(), 2, "scatter-write expects a matrix, got {:?}", block.shape());
        let ncol = block.shape()[1];
        for (k, (c0, c1)) in blocking::prange(0, ncol, column_chunk.max(1)).enumerate() {
            let chunk = block.i((.., c0..c1));
            self.write_dataset(&format!("{group}/{tag}.{k}"), &chunk.t())?;
        }
        Ok(())
    }

    /// Entries of a scatter-written group, ordered by `(tag, chunk)`.
    fn group_entries(&self, group: &str) -> Result<Vec<(usize, usize, NpyTensor)>> {
        let dir = self.root.join(group);
        let mut entries = vec![];
        for entry in std::fs::read_dir(&dir).with_context(|| format!("missing scratch group {group}"))? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let Some((tag, chunk)) = stem.split_once('.') else { continue };
            let (Ok(tag), Ok(chunk)) = (tag.parse::<usize>(), chunk.parse::<usize>()) else { continue };
            entries.push((tag, chunk, NpyTensor::open(&path)?));
        }
        entries.sort_by_key(|(tag, chunk, _)| (*tag, *chunk));
        Ok(entries)
    }

    /// Index a scatter-written group once, for repeated gathers.
    pub fn group(&self, group: &str) -> Result<ScratchGroup> {
        let entries = self.group_entries(group)?;
        let by_tag = entries.into_iter().chunk_by(|(tag, _, _)| *tag);
        let mut tags = vec![];
        for (_, chunks) in &by_tag {
            let mut off = 0;
            let chunks = chunks
                .map(|(_, _, dset)| {
                    off += dset.nrow();
                    (off - dset.nrow(), dset)
                })
                .collect::<Vec<_>>();
            let width = chunks.first().map_or(0, |(_, dset)| dset.shape[1]);
            tags.push((width, chunks));
        }
        Ok(ScratchGroup { name: group.to_string(), tags })
    }

    pub fn remove_group(&self, group: &str) -> Result<()> {
        let dir = self.root.join(group);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn remove_dataset(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn remove(self) -> Result<()> {
        std::fs::remove_dir_all(&self.root).with_context(|| format!("cannot remove scratch {}", self.root.display()))?;
        debug!("scratch store removed at {}", self.root.display());
        Ok(())
    }
}

/// Chunk layout of a scatter-written group.
#[derive(Debug)]
pub struct ScratchGroup {
    name: String,
    /// Per tag in order: column width and `(first row, chunk)` pairs.
    tags: Vec<(usize, Vec<(usize, NpyTensor)>)>,
}

impl ScratchGroup {
    pub fn ncol(&self) -> usize {
        self.tags.iter().map(|(width, _)| width).sum()
    }

    /// Gather-read: rows `[row0, row1)` of the transposed layout, all tags concatenated along
    /// columns in tag order. Only chunks overlapping the rows are opened.
    pub fn load_rows(&self, row0: usize, row1: usize, device: &DeviceTsr) -> Result<Tsr> {
        let mut out: Tsr = rt::zeros(([row1 - row0, self.ncol()], device));
        let mut col0 = 0;
        for (width, chunks) in &self.tags {
            let nrow = chunks.last().map_or(0, |(off, dset)| off + dset.nrow());
            ensure!(row1 <= nrow, "gather rows {row0}..{row1} exceed {nrow} rows of group {}", self.name);
            for (off, dset) in chunks {
                let (r0, r1) = (row0.max(*off), row1.min(off + dset.nrow()));
                if r0 < r1 {
                    let piece = dset.read_rows(r0 - off, r1 - off, device)?;
                    out.i_mut((r0 - row0..r1 - row0, col0..col0 + width)).assign(&piece);
                }
            }
            col0 += width;
        }
        Ok(out)
    }
}

/* #endregion */
