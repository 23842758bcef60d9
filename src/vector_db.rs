use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};

use crate::error::{Error, Result};

/// Chunk vectors keyed by corpus position.
const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");

/// Fingerprint, dimension and count of what `VECTORS` currently holds.
const MANIFEST: TableDefinition<&str, u64> = TableDefinition::new("manifest");

const KEY_FINGERPRINT: &str = "fingerprint";
const KEY_DIMENSION: &str = "dimension";
const KEY_COUNT: &str = "count";

/// Persistent store for the semantic index.
///
/// Each entry is a raw little-endian `f32` vector. The manifest records the
/// fingerprint of the corpus and embedder that produced the vectors, so a
/// later build can tell whether they are still valid.
pub struct VectorDb {
    db: Database,
}

impl VectorDb {
    /// Open or create a vector database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use fusionrag::VectorDb;
    ///
    /// let db = VectorDb::open(&tmp.path().join("vectors.redb")).unwrap();
    /// assert_eq!(db.len().unwrap(), 0);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(VECTORS)?;
        txn.open_table(MANIFEST)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Replace every stored vector in a single write transaction.
    ///
    /// The old table is dropped first, so nothing from a previous corpus
    /// survives even when the new corpus is smaller.
    pub fn replace_all(
        &self,
        fingerprint: u64,
        dimension: usize,
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        if let Some(bad) = vectors.iter().position(|v| v.len() != dimension) {
            return Err(Error::EmbeddingService(format!(
                "vector {bad} has dimension {}, expected {dimension}",
                vectors[bad].len()
            )));
        }

        let txn = self.db.begin_write()?;
        txn.delete_table(VECTORS)?;
        txn.delete_table(MANIFEST)?;
        {
            let mut table = txn.open_table(VECTORS)?;
            for (position, data) in vectors.iter().enumerate() {
                let byte_len = std::mem::size_of_val(data.as_slice());
                let mut guard =
                    table.insert_reserve(position as u64, byte_len)?;
                guard
                    .as_mut()
                    .copy_from_slice(bytemuck::cast_slice(data.as_slice()));
            }

            let mut manifest = txn.open_table(MANIFEST)?;
            manifest.insert(KEY_FINGERPRINT, fingerprint)?;
            manifest.insert(KEY_DIMENSION, dimension as u64)?;
            manifest.insert(KEY_COUNT, vectors.len() as u64)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Load all vectors if they were stored under `fingerprint`.
    ///
    /// Returns `None` on a fingerprint mismatch or when the stored data is
    /// incomplete; the caller then re-embeds.
    pub fn load(&self, fingerprint: u64) -> Result<Option<Vec<Vec<f32>>>> {
        let txn = self.db.begin_read()?;
        let manifest = txn.open_table(MANIFEST)?;

        let read = |key: &str| -> Result<Option<u64>> {
            Ok(manifest.get(key)?.map(|v| v.value()))
        };
        let (Some(stored), Some(dimension), Some(count)) = (
            read(KEY_FINGERPRINT)?,
            read(KEY_DIMENSION)?,
            read(KEY_COUNT)?,
        ) else {
            return Ok(None);
        };
        if stored != fingerprint {
            return Ok(None);
        }

        let table = txn.open_table(VECTORS)?;
        let expected_len = dimension as usize * std::mem::size_of::<f32>();
        let mut vectors = Vec::with_capacity(count as usize);
        for position in 0..count {
            let Some(guard) = table.get(position)? else {
                return Ok(None);
            };
            let bytes = guard.value();
            if bytes.len() != expected_len {
                return Ok(None);
            }
            // redb values carry no alignment guarantee.
            vectors.push(bytemuck::pod_collect_to_vec::<u8, f32>(bytes));
        }

        Ok(Some(vectors))
    }

    /// The fingerprint of the stored vectors, if any.
    pub fn fingerprint(&self) -> Result<Option<u64>> {
        let txn = self.db.begin_read()?;
        let manifest = txn.open_table(MANIFEST)?;
        Ok(manifest.get(KEY_FINGERPRINT)?.map(|v| v.value()))
    }

    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every stored vector and the manifest.
    pub fn clear(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.delete_table(VECTORS)?;
        txn.delete_table(MANIFEST)?;
        txn.open_table(VECTORS)?;
        txn.open_table(MANIFEST)?;
        txn.commit()?;
        Ok(())
    }
}
