use std::path::{Path, PathBuf};
use tempfile::TempDir;
use telco_xml_tables::StorageBackend;

/// Test fixture paths
pub struct TestFixtures {
    pub fixtures_dir: PathBuf,
}

impl TestFixtures {
    pub fn new() -> Self {
        let fixtures_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures");

        Self { fixtures_dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.fixtures_dir.join(name)
    }

    pub fn bulkcm(&self) -> PathBuf {
        self.path("bulkcm.xml")
    }

    pub fn bulkcm_with_utrancell(&self) -> PathBuf {
        self.path("bulkcm_with_utrancell.xml")
    }

    pub fn tag_mismatch(&self) -> PathBuf {
        self.path("tag_mismatch.xml")
    }

    pub fn bulkcm_empty(&self) -> PathBuf {
        self.path("bulkcm_empty.xml")
    }

    /// Copy the named fixtures into a fresh scratch directory
    pub fn stage(&self, names: &[&str]) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        for name in names {
            std::fs::copy(self.path(name), temp_dir.path().join(name)).unwrap();
        }
        temp_dir
    }
}

/// Header and rows of a CSV object
pub fn read_csv<B: StorageBackend>(storage: &B, key: &str) -> (Vec<String>, Vec<Vec<String>>) {
    let bytes = storage.read(key).unwrap();
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let header = reader
        .headers()
        .unwrap()
        .iter()
        .map(str::to_string)
        .collect();
    let rows = reader
        .records()
        .map(|record| record.unwrap().iter().map(str::to_string).collect())
        .collect();
    (header, rows)
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

pub fn pattern(dir: &Path, glob: &str) -> String {
    format!("{}/{}", dir.display(), glob)
}
