//! Registry of indexed reference genomes.

use std::collections::BTreeMap;
use std::sync::{LazyLock, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::schema::CatalogConfig;
use crate::error::StoreError;
use crate::store::ExternalStore;

/// Suffix of the per-genome samtools index archive in the index repository.
pub const INDEX_ARCHIVE_SUFFIX: &str = "_samtools.tar.gz";

static GENOME_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("genome name pattern is valid")
});

pub fn is_valid_genome_name(name: &str) -> bool {
    GENOME_NAME.is_match(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenomeEntry {
    pub name: String,
    pub indexed_path: String,
}

/// Read-mostly genome registry.
///
/// Entries from the config are always present; entries discovered in the index repository are
/// added by [`GenomeCatalog::refresh`]. A published entry is never replaced.
pub struct GenomeCatalog {
    index_repo: String,
    entries: RwLock<BTreeMap<String, GenomeEntry>>,
}

impl GenomeCatalog {
    pub fn new(index_repo: &str) -> Self {
        Self {
            index_repo: index_repo.to_string(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &CatalogConfig) -> Self {
        let catalog = Self::new(&config.index_repo);
        for genome in &config.genomes {
            catalog.publish(GenomeEntry {
                name: genome.name.clone(),
                indexed_path: genome.path.clone(),
            });
        }
        catalog
    }

    pub fn index_repo(&self) -> &str {
        &self.index_repo
    }

    /// Adds an entry unless one with the same name exists. Returns whether it was added.
    pub fn publish(&self, entry: GenomeEntry) -> bool {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Genome catalog lock poisoned, recovering");
                poisoned.into_inner()
            }
        };

        if entries.contains_key(&entry.name) {
            return false;
        }
        entries.insert(entry.name.clone(), entry);
        true
    }

    pub fn get(&self, name: &str) -> Option<GenomeEntry> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Genome names, sorted.
    pub fn list_genomes(&self) -> Vec<String> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.keys().cloned().collect()
    }

    /// Scans the index repository for `<genome>_samtools.tar.gz` archives and publishes new
    /// genomes. Returns how many were added.
    pub fn refresh(&self, store: &dyn ExternalStore) -> Result<usize, StoreError> {
        let statuses = match store.list_status(&self.index_repo, "") {
            Ok(statuses) => statuses,
            Err(StoreError::NotFound(_)) => {
                log::debug!("Index repository {} does not exist yet", self.index_repo);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut added = 0;
        for status in statuses.iter().filter(|s| !s.is_dir) {
            let file_name = status.path.rsplit('/').next().unwrap_or_default();
            let Some(name) = file_name.strip_suffix(INDEX_ARCHIVE_SUFFIX) else {
                continue;
            };
            if !is_valid_genome_name(name) {
                log::warn!("Skipping index archive with invalid genome name: {}", status.path);
                continue;
            }

            let entry = GenomeEntry {
                name: name.to_string(),
                indexed_path: self.index_repo.clone(),
            };
            if self.publish(entry) {
                log::info!("Discovered genome {}", name);
                added += 1;
            }
        }

        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::GenomeConfig;
    use crate::store::LocalStore;
    use tempfile::TempDir;

    #[test]
    fn test_genome_name_validation() {
        assert!(is_valid_genome_name("hg19"));
        assert!(is_valid_genome_name("GRCh38.p13"));
        assert!(is_valid_genome_name("mm_10-x"));
        assert!(!is_valid_genome_name(""));
        assert!(!is_valid_genome_name("../etc"));
        assert!(!is_valid_genome_name("a/b"));
        assert!(!is_valid_genome_name(".hidden"));
    }

    #[test]
    fn test_list_genomes_sorted() {
        let config = CatalogConfig {
            genomes: vec![
                GenomeConfig {
                    name: "mm10".to_string(),
                    path: "/genomes".to_string(),
                },
                GenomeConfig {
                    name: "hg19".to_string(),
                    path: "/genomes".to_string(),
                },
            ],
            ..CatalogConfig::default()
        };
        let catalog = GenomeCatalog::from_config(&config);
        assert_eq!(catalog.list_genomes(), vec!["hg19", "mm10"]);
        assert!(catalog.contains("hg19"));
        assert!(!catalog.contains("dm3"));
    }

    #[test]
    fn test_published_entry_is_not_replaced() {
        let catalog = GenomeCatalog::new("/genomes");
        assert!(catalog.publish(GenomeEntry {
            name: "hg19".to_string(),
            indexed_path: "/a".to_string(),
        }));
        assert!(!catalog.publish(GenomeEntry {
            name: "hg19".to_string(),
            indexed_path: "/b".to_string(),
        }));
        assert_eq!(catalog.get("hg19").unwrap().indexed_path, "/a");
    }

    #[test]
    fn test_refresh_discovers_index_archives() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("genomes");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("hg19_samtools.tar.gz"), b"").unwrap();
        std::fs::write(repo.join("hg19_bowtie.tar.gz"), b"").unwrap();
        std::fs::write(repo.join("sacCer3_samtools.tar.gz"), b"").unwrap();
        std::fs::write(repo.join("README"), b"").unwrap();

        let store = LocalStore::new(dir.path(), "user");
        let catalog = GenomeCatalog::new("/genomes");

        assert_eq!(catalog.refresh(&store).unwrap(), 2);
        assert_eq!(catalog.list_genomes(), vec!["hg19", "sacCer3"]);
        assert_eq!(catalog.refresh(&store).unwrap(), 0);
    }

    #[test]
    fn test_refresh_with_missing_repo() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path(), "user");
        let catalog = GenomeCatalog::new("/genomes");
        assert_eq!(catalog.refresh(&store).unwrap(), 0);
        assert!(catalog.list_genomes().is_empty());
    }
}
