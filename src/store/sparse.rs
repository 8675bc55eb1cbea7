use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;

use super::{
    RowPredicate,
    checkpoint::{ExportedPartition, SparseRecord, SparseRow},
};
use crate::{
    error::{PsErr, Result},
    initialization::Initializer,
    optimization::Updater,
};

type Partition = HashMap<u64, SparseRow>;

/// Copies of the rows of some keys of a partition, in key order.
struct Gathered {
    keys: Vec<u64>,
    values: Array2<f32>,
    state: Array2<f32>,
}

/// The authoritative copy of a sparse table.
///
/// Keys are spread across partitions by `key % partition_count`, every partition behind
/// its own lock. The table version advances once per push and every pushed row remembers
/// the version it was last touched in, its age being the difference with the current one.
#[derive(Debug)]
pub struct SparseTable {
    name: String,
    width: usize,
    initializer: Arc<dyn Initializer>,
    updater: Arc<dyn Updater>,
    version: AtomicU64,
    partitions: Box<[Mutex<Partition>]>,
}

impl SparseTable {
    /// Creates a new empty `SparseTable`.
    ///
    /// # Arguments
    /// * `name` - The qualified name of the table.
    /// * `width` - The amount of values per row, must be positive.
    /// * `partition_count` - The amount of partitions, must be positive.
    /// * `initializer` - Fills the rows of new keys.
    /// * `updater` - The update rule of every row.
    ///
    /// # Returns
    /// A new `SparseTable` or an error if `width` or `partition_count` are zero.
    pub fn new(
        name: &str,
        width: usize,
        partition_count: usize,
        initializer: Arc<dyn Initializer>,
        updater: Arc<dyn Updater>,
    ) -> Result<Self> {
        if width == 0 {
            return Err(PsErr::invalid("width", width, "a positive integer"));
        }

        if partition_count == 0 {
            return Err(PsErr::invalid(
                "partition_count",
                partition_count,
                "a positive integer",
            ));
        }

        let partitions = (0..partition_count)
            .map(|_| Mutex::new(Partition::new()))
            .collect();

        Ok(Self {
            name: name.to_string(),
            width,
            initializer,
            updater,
            version: AtomicU64::new(0),
            partitions,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// The amount of keys currently in the table.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    fn partition_of(&self, key: u64) -> usize {
        (key % self.partitions.len() as u64) as usize
    }

    /// Groups the positions of `keys` by the partition owning each key.
    fn group(&self, keys: &[u64]) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.partitions.len()];

        for (pos, &key) in keys.iter().enumerate() {
            groups[self.partition_of(key)].push(pos);
        }

        groups
    }

    fn check_rows(&self, what: &'static str, keys: &[u64], rows: &ArrayView2<'_, f32>) -> Result<()> {
        if rows.ncols() != self.width {
            return Err(PsErr::SizeMismatch {
                what,
                got: rows.ncols(),
                expected: self.width,
            });
        }

        if rows.nrows() != keys.len() {
            return Err(PsErr::SizeMismatch {
                what,
                got: rows.nrows(),
                expected: keys.len(),
            });
        }

        let mut seen = HashSet::with_capacity(keys.len());
        if let Some(key) = keys.iter().find(|&&key| !seen.insert(key)) {
            return Err(PsErr::invalid("key", key, "unique within a single push"));
        }

        Ok(())
    }

    /// Locks the partitions owning `keys`, in index order.
    ///
    /// # Returns
    /// Every touched partition with the positions in `keys` it owns.
    fn lock_touched(&self, keys: &[u64]) -> Vec<(MutexGuard<'_, Partition>, Vec<usize>)> {
        self.partitions
            .iter()
            .zip(self.group(keys))
            .filter(|(_, positions)| !positions.is_empty())
            .map(|(partition, positions)| (partition.lock(), positions))
            .collect()
    }

    /// Copies the rows of `keys` out of `partition`, initializing the missing ones in the
    /// copy only.
    fn gather(&self, partition: &Partition, keys: &[u64]) -> Result<Gathered> {
        let state_width = self.width * self.updater.states_per_param();
        let mut values = Array2::zeros((keys.len(), self.width));
        let mut state = Array2::zeros((keys.len(), state_width));

        let mut missing: Vec<u64> = keys
            .iter()
            .filter(|&key| !partition.contains_key(key))
            .copied()
            .collect();
        missing.sort_unstable();
        missing.dedup();

        let mut fresh = Array2::zeros((missing.len(), self.width));
        if !missing.is_empty() {
            self.initializer
                .initialize_sparse(&self.name, fresh.view_mut(), &missing)?;
        }

        for (i, key) in keys.iter().enumerate() {
            match partition.get(key) {
                Some(row) => {
                    values.row_mut(i).assign(&ArrayView1::from(&row.values));
                    state.row_mut(i).assign(&ArrayView1::from(&row.state));
                }
                None => {
                    // SAFETY: Every key absent from the partition is in `missing`.
                    let j = missing.binary_search(key).unwrap();
                    values.row_mut(i).assign(&fresh.row(j));
                }
            }
        }

        Ok(Gathered {
            keys: keys.to_vec(),
            values,
            state,
        })
    }

    /// Gathers one row per key, creating the missing ones.
    ///
    /// # Returns
    /// The rows, or an error leaving the table untouched if a new row can't be initialized.
    pub fn get_slice(&self, keys: &[u64]) -> Result<Array2<f32>> {
        let mut touched = self.lock_touched(keys);
        let staged = touched
            .iter()
            .map(|(partition, positions)| {
                let part_keys: Vec<u64> = positions.iter().map(|&pos| keys[pos]).collect();
                self.gather(partition, &part_keys)
            })
            .collect::<Result<Vec<_>>>()?;

        let version = self.version();
        let mut out = Array2::zeros((keys.len(), self.width));

        for ((partition, positions), gathered) in touched.iter_mut().zip(staged) {
            for (i, (&pos, &key)) in positions.iter().zip(&gathered.keys).enumerate() {
                out.row_mut(pos).assign(&gathered.values.row(i));
                partition.entry(key).or_insert_with(|| SparseRow {
                    values: gathered.values.row(i).to_vec(),
                    state: gathered.state.row(i).to_vec(),
                    last_touched: version,
                });
            }
        }

        Ok(out)
    }

    /// Overwrites the values of the rows of `keys`, creating the missing ones.
    pub fn set_slice(&self, keys: &[u64], rows: ArrayView2<'_, f32>) -> Result<()> {
        self.check_rows("sparse value rows", keys, &rows)?;
        let state_width = self.width * self.updater.states_per_param();

        let mut touched = self.lock_touched(keys);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

        for (partition, positions) in touched.iter_mut() {
            for &pos in positions.iter() {
                let row = partition.entry(keys[pos]).or_insert_with(|| SparseRow {
                    values: Vec::new(),
                    state: vec![0.; state_width],
                    last_touched: version,
                });

                row.values = rows.row(pos).to_vec();
                row.last_touched = version;
            }
        }

        Ok(())
    }

    /// Applies the updater to the rows of `keys`.
    ///
    /// Every touched partition is locked, its rows are copied and updated in parallel, and
    /// the copies are written back only once every partition succeeded. A failing push
    /// leaves the rows and the version untouched.
    pub fn apply_update(&self, keys: &[u64], grads: ArrayView2<'_, f32>) -> Result<()> {
        self.check_rows("sparse gradient rows", keys, &grads)?;
        let num = self.updater.states_per_param();

        let mut touched = self.lock_touched(keys);
        let staged = touched
            .iter()
            .map(|(partition, positions)| (&**partition, positions))
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(partition, positions)| -> Result<Gathered> {
                let part_keys: Vec<u64> = positions.iter().map(|&pos| keys[pos]).collect();
                let grad = grads.select(Axis(0), positions);
                let mut gathered = self.gather(partition, &part_keys)?;

                let indices: Vec<usize> = (0..part_keys.len()).collect();
                let state = (num > 0).then(|| gathered.state.view_mut());
                self.updater.update_sparse(
                    &self.name,
                    gathered.values.view_mut(),
                    grad.view(),
                    state,
                    &indices,
                    &part_keys,
                )?;

                Ok(gathered)
            })
            .collect::<Result<Vec<_>>>()?;

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

        for ((partition, _), gathered) in touched.iter_mut().zip(staged) {
            for (i, key) in gathered.keys.iter().enumerate() {
                partition.insert(
                    *key,
                    SparseRow {
                        values: gathered.values.row(i).to_vec(),
                        state: gathered.state.row(i).to_vec(),
                        last_touched: version,
                    },
                );
            }
        }

        Ok(())
    }

    /// Removes the rows matching `predicate`.
    ///
    /// # Returns
    /// The amount of removed rows.
    pub fn delete_where(&self, predicate: RowPredicate) -> usize {
        let version = self.version();

        self.partitions
            .par_iter()
            .map(|partition| {
                let mut partition = partition.lock();
                let before = partition.len();

                partition.retain(|_, row| {
                    let age = version.saturating_sub(row.last_touched);
                    !predicate.matches(&row.values, age)
                });

                before - partition.len()
            })
            .sum()
    }

    /// Takes a copy of every row, sorted by key.
    pub fn snapshot(&self) -> SparseRecord {
        let mut rows: Vec<(u64, SparseRow)> = self
            .partitions
            .iter()
            .flat_map(|partition| {
                partition
                    .lock()
                    .iter()
                    .map(|(&key, row)| (key, row.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        rows.sort_unstable_by_key(|(key, _)| *key);

        SparseRecord {
            width: self.width,
            version: self.version(),
            rows,
        }
    }

    /// Replaces every row with the ones of a checkpoint.
    ///
    /// # Arguments
    /// * `record` - The checkpoint, it may come from a table with another partition count.
    /// * `keep_meta` - Whether to keep the version and the row ages or reset them.
    ///
    /// # Returns
    /// A `SizeMismatch` error, leaving the table untouched, if the record doesn't fit.
    pub fn restore(&self, record: SparseRecord, keep_meta: bool) -> Result<()> {
        if record.width != self.width {
            return Err(PsErr::SizeMismatch {
                what: "sparse checkpoint width",
                got: record.width,
                expected: self.width,
            });
        }

        let state_width = self.width * self.updater.states_per_param();
        if let Some((_, row)) = record
            .rows
            .iter()
            .find(|(_, row)| row.values.len() != self.width || row.state.len() != state_width)
        {
            return Err(PsErr::SizeMismatch {
                what: "sparse checkpoint row",
                got: row.values.len() + row.state.len(),
                expected: self.width + state_width,
            });
        }

        let mut partitions: Vec<_> = self.partitions.iter().map(|p| p.lock()).collect();
        partitions.iter_mut().for_each(|p| p.clear());

        for (key, mut row) in record.rows {
            if !keep_meta {
                row.last_touched = 0;
            }

            partitions[self.partition_of(key)].insert(key, row);
        }

        let version = if keep_meta { record.version } else { 0 };
        self.version.store(version, Ordering::Release);
        Ok(())
    }

    /// Copies the values of every partition, without state nor ages.
    pub fn export(&self) -> Vec<ExportedPartition> {
        self.partitions
            .iter()
            .map(|partition| {
                let mut rows: Vec<_> = partition
                    .lock()
                    .iter()
                    .map(|(&key, row)| (key, row.values.clone()))
                    .collect();

                rows.sort_unstable_by_key(|(key, _)| *key);

                ExportedPartition {
                    width: self.width,
                    rows,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayViewMut2, ArrayViewMutD, array};

    use super::*;
    use crate::{
        initialization::ConstInit,
        optimization::{Adam, Sgd},
    };

    /// Fills rows with ones, except for one key it can't initialize.
    #[derive(Debug)]
    struct FailsOn(u64);

    impl Initializer for FailsOn {
        fn initialize_dense(&self, _name: &str, mut data: ArrayViewMutD<'_, f32>) -> Result<()> {
            data.fill(1.);
            Ok(())
        }

        fn initialize_sparse(
            &self,
            _name: &str,
            mut data: ArrayViewMut2<'_, f32>,
            keys: &[u64],
        ) -> Result<()> {
            if keys.contains(&self.0) {
                return Err(PsErr::State(format!("can't initialize key {}", self.0)));
            }

            data.fill(1.);
            Ok(())
        }
    }

    fn sgd_table(partitions: usize) -> SparseTable {
        SparseTable::new(
            "emb",
            2,
            partitions,
            Arc::new(ConstInit::one()),
            Arc::new(Sgd::new(1.0).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn pull_creates_missing_rows_once() {
        let table = sgd_table(3);

        let rows = table.get_slice(&[4, 7, 4]).unwrap();
        assert_eq!(rows, array![[1f32, 1.], [1., 1.], [1., 1.]]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.version(), 0);
    }

    #[test]
    fn push_touches_only_its_rows() {
        let table = sgd_table(2);
        table.get_slice(&[1, 2, 3]).unwrap();

        table
            .apply_update(&[2, 3], array![[0.5, 0.5], [1.0, 1.0]].view())
            .unwrap();

        let rows = table.get_slice(&[1, 2, 3]).unwrap();
        assert_eq!(rows, array![[1f32, 1.], [0.5, 0.5], [0., 0.]]);
        assert_eq!(table.version(), 1);
    }

    #[test]
    fn duplicate_keys_in_a_push_fail_before_writing() {
        let table = sgd_table(2);

        let err = table
            .apply_update(&[5, 5], array![[1., 1.], [1., 1.]].view())
            .unwrap_err();

        assert!(matches!(err, PsErr::InvalidArgument { .. }));
        assert_eq!(table.len(), 0);
        assert_eq!(table.version(), 0);
    }

    #[test]
    fn failed_operations_leave_every_partition_untouched() {
        let table = SparseTable::new(
            "emb",
            1,
            2,
            Arc::new(FailsOn(3)),
            Arc::new(Sgd::new(1.0).unwrap()),
        )
        .unwrap();
        table.get_slice(&[2]).unwrap();
        let before = table.snapshot();

        for _ in 0..20 {
            assert!(table.apply_update(&[2, 3], array![[0.5f32], [0.5]].view()).is_err());
            assert!(table.get_slice(&[4, 3]).is_err());
        }

        assert_eq!(table.snapshot(), before);
        assert_eq!(table.version(), 0);
        assert_eq!(table.get_slice(&[2]).unwrap(), array![[1f32]]);
    }

    #[test]
    fn set_slice_creates_rows_with_empty_state() {
        let adam = Arc::new(Adam::new(0.1, 0.9, 0.999, 1e-8).unwrap());
        let table = SparseTable::new("emb", 2, 2, Arc::new(FailsOn(3)), adam).unwrap();

        table.set_slice(&[3, 4], array![[1f32, 2.], [3., 4.]].view()).unwrap();

        let record = table.snapshot();
        assert_eq!(record.version, 1);
        assert_eq!(record.rows[0].1.values, [1., 2.]);
        assert_eq!(record.rows[0].1.state, [0.; 4]);
        assert!(record.rows.iter().all(|(_, row)| row.last_touched == 1));
    }

    #[test]
    fn prune_old_uses_push_versions() {
        let table = sgd_table(4);
        let grad = array![[0., 0.]];

        table.apply_update(&[10], grad.view()).unwrap();
        for _ in 0..4 {
            table.apply_update(&[11], grad.view()).unwrap();
        }
        table.apply_update(&[12], grad.view()).unwrap();
        table.apply_update(&[11], grad.view()).unwrap();
        table.apply_update(&[11], grad.view()).unwrap();

        // Ages: 10 -> 7, 12 -> 2, 11 -> 0.
        let removed = table.delete_where(RowPredicate::Old { max_age: 3 });

        assert_eq!(removed, 1);
        let keys: Vec<u64> = table.snapshot().rows.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, [11, 12]);
    }

    #[test]
    fn restore_rehashes_and_resets_ages() {
        let adam = Arc::new(Adam::new(0.1, 0.9, 0.999, 1e-8).unwrap());
        let table = SparseTable::new("emb", 2, 3, Arc::new(ConstInit::one()), adam.clone()).unwrap();
        table
            .apply_update(&[1, 2, 3], array![[1., 2.], [3., 4.], [5., 6.]].view())
            .unwrap();
        let record = table.snapshot();

        let other = SparseTable::new("emb", 2, 5, Arc::new(ConstInit::zero()), adam).unwrap();
        other.restore(record.clone(), true).unwrap();
        assert_eq!(other.snapshot(), record);

        other.restore(record.clone(), false).unwrap();
        let reset = other.snapshot();
        assert_eq!(reset.version, 0);
        assert!(reset.rows.iter().all(|(_, row)| row.last_touched == 0));
        assert_eq!(reset.rows[0].1.values, record.rows[0].1.values);
    }

    #[test]
    fn restore_rejects_other_widths() {
        let table = sgd_table(1);
        let record = SparseRecord {
            width: 3,
            version: 0,
            rows: Vec::new(),
        };

        assert!(table.restore(record, true).is_err());
    }
}
