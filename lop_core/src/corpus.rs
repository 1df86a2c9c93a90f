use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Defines errors that can arise during seed-store operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested seed id was not found in the queue.
    #[error("Seed id {0} not found in queue")]
    SeedNotFound(usize),

    /// An I/O error occurred while reading or writing queue or crash files.
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for CorpusError {
    fn from(err: io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// One admitted input. Identity is fixed at admission and never updated,
/// except for the `favoured` flag which the scheduler recomputes.
#[derive(Debug, Clone)]
pub struct Seed {
    pub id: usize,
    pub path: PathBuf,
    /// Edges covered by the execution that admitted this seed.
    pub coverage: HashSet<usize>,
    /// Wall-clock duration of that execution, in seconds.
    pub exec_time: f64,
    /// Byte length of the input on disk.
    pub size: u64,
    pub favoured: bool,
}

impl Seed {
    /// Sort key for favoured-seed selection. Smaller is better.
    pub fn valuation(&self) -> f64 {
        self.size as f64 * self.exec_time
    }
}

/// The on-disk queue plus its in-memory bookkeeping: seed records, the
/// global coverage set, and the edge-to-seeds reverse index.
pub struct Corpus {
    queue_dir: PathBuf,
    crashes_dir: PathBuf,
    queue: Vec<Seed>,
    global_coverage: HashSet<usize>,
    edge_to_seeds: HashMap<usize, Vec<usize>>,
}

impl Corpus {
    /// Creates the queue and crashes folders if needed.
    pub fn new(queue_dir: PathBuf, crashes_dir: PathBuf) -> Result<Self, CorpusError> {
        fs::create_dir_all(&queue_dir)
            .map_err(|e| CorpusError::Io(format!("cannot create queue folder {queue_dir:?}: {e}")))?;
        fs::create_dir_all(&crashes_dir).map_err(|e| {
            CorpusError::Io(format!("cannot create crashes folder {crashes_dir:?}: {e}"))
        })?;
        Ok(Self {
            queue_dir,
            crashes_dir,
            queue: Vec::new(),
            global_coverage: HashSet::new(),
            edge_to_seeds: HashMap::new(),
        })
    }

    /// Admits an input as a new seed, unless its coverage is already fully
    /// contained in the global set.
    ///
    /// On admission the bytes are written to `<queue>/id_<id>`, the global
    /// coverage absorbs the seed's edges, and the reverse index gains the
    /// new id for every covered edge. Returns the assigned id, or `None`
    /// when the input brought nothing new.
    pub fn admit(
        &mut self,
        bytes: &[u8],
        coverage: HashSet<usize>,
        exec_time: f64,
    ) -> Result<Option<usize>, CorpusError> {
        if coverage.is_subset(&self.global_coverage) {
            return Ok(None);
        }

        let id = self.queue.len();
        let path = self.queue_dir.join(format!("id_{id}"));
        write_atomic(&path, bytes)?;

        for edge in &coverage {
            self.edge_to_seeds.entry(*edge).or_default().push(id);
        }
        self.global_coverage.extend(coverage.iter().copied());

        self.queue.push(Seed {
            id,
            path,
            coverage,
            exec_time,
            size: bytes.len() as u64,
            favoured: false,
        });
        Ok(Some(id))
    }

    /// Persists a crashing input as `crash_<unix_ts>[_<origin_basename>]`.
    /// No deduplication beyond the filename.
    pub fn save_crash(
        &self,
        bytes: &[u8],
        origin: Option<&Path>,
    ) -> Result<PathBuf, CorpusError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CorpusError::Io(format!("system clock before epoch: {e}")))?
            .as_secs();

        let filename = match origin.and_then(|p| p.file_name()).and_then(|n| n.to_str()) {
            Some(basename) => format!("crash_{timestamp}_{basename}"),
            None => format!("crash_{timestamp}"),
        };
        let path = self.crashes_dir.join(filename);
        write_atomic(&path, bytes)?;
        log::info!(
            "saved crash input to {:?} (md5 {:x})",
            path,
            md5::compute(bytes)
        );
        Ok(path)
    }

    pub fn seed(&self, id: usize) -> Result<&Seed, CorpusError> {
        self.queue.get(id).ok_or(CorpusError::SeedNotFound(id))
    }

    /// Reads a seed's bytes fresh from disk.
    pub fn read_seed(&self, id: usize) -> Result<Vec<u8>, CorpusError> {
        let seed = self.seed(id)?;
        fs::read(&seed.path)
            .map_err(|e| CorpusError::Io(format!("cannot read seed {:?}: {e}", seed.path)))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn seeds(&self) -> &[Seed] {
        &self.queue
    }

    pub fn global_coverage(&self) -> &HashSet<usize> {
        &self.global_coverage
    }

    pub fn edge_index(&self) -> &HashMap<usize, Vec<usize>> {
        &self.edge_to_seeds
    }

    /// Overwrites every seed's favoured flag; ids in `winners` become
    /// favoured, everything else is cleared.
    pub fn set_favoured(&mut self, winners: &HashSet<usize>) {
        for seed in &mut self.queue {
            seed.favoured = winners.contains(&seed.id);
        }
    }
}

/// Writes through a temp name in the destination directory, then renames
/// into place. An interrupted write leaves only the temp file behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CorpusError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .map_err(|e| CorpusError::Io(format!("cannot write {tmp:?}: {e}")))?;
    fs::rename(&tmp, path)
        .map_err(|e| CorpusError::Io(format!("cannot rename {tmp:?} to {path:?}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn corpus_in(dir: &Path) -> Corpus {
        Corpus::new(dir.join("queue"), dir.join("crashes")).unwrap()
    }

    #[test]
    fn admit_assigns_dense_ids_and_writes_queue_files() {
        let dir = tempdir().unwrap();
        let mut corpus = corpus_in(dir.path());

        let id0 = corpus
            .admit(b"first", HashSet::from([1, 2]), 0.01)
            .unwrap()
            .expect("novel coverage should be admitted");
        let id1 = corpus
            .admit(b"second", HashSet::from([2, 3]), 0.02)
            .unwrap()
            .expect("edge 3 is new");

        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
        assert_eq!(corpus.len(), 2);

        let seed0 = corpus.seed(0).unwrap();
        assert_eq!(seed0.id, 0);
        assert_eq!(seed0.size, 5);
        assert!(seed0.path.ends_with("id_0"));
        assert_eq!(fs::read(&seed0.path).unwrap(), b"first");
        assert_eq!(corpus.read_seed(1).unwrap(), b"second");
    }

    #[test]
    fn admit_refuses_already_covered_inputs() {
        let dir = tempdir().unwrap();
        let mut corpus = corpus_in(dir.path());

        corpus
            .admit(b"aaaa", HashSet::from([10, 11, 12]), 0.01)
            .unwrap()
            .unwrap();
        // Strict subset of the global set: refused.
        assert!(corpus
            .admit(b"bbbb", HashSet::from([10, 12]), 0.01)
            .unwrap()
            .is_none());
        // Empty coverage is trivially contained: refused.
        assert!(corpus.admit(b"cccc", HashSet::new(), 0.01).unwrap().is_none());
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn global_coverage_is_union_of_seed_coverage() {
        let dir = tempdir().unwrap();
        let mut corpus = corpus_in(dir.path());

        corpus.admit(b"aaaa", HashSet::from([1]), 0.01).unwrap();
        corpus.admit(b"bbbb", HashSet::from([1, 5]), 0.01).unwrap();
        corpus.admit(b"cccc", HashSet::from([9]), 0.01).unwrap();

        let mut union = HashSet::new();
        for seed in corpus.seeds() {
            union.extend(seed.coverage.iter().copied());
        }
        assert_eq!(&union, corpus.global_coverage());
        assert_eq!(corpus.global_coverage(), &HashSet::from([1, 5, 9]));
    }

    #[test]
    fn edge_index_matches_seed_coverage_both_ways() {
        let dir = tempdir().unwrap();
        let mut corpus = corpus_in(dir.path());

        corpus.admit(b"aaaa", HashSet::from([1, 2]), 0.01).unwrap();
        corpus.admit(b"bbbb", HashSet::from([2, 3]), 0.01).unwrap();

        for seed in corpus.seeds() {
            for edge in &seed.coverage {
                assert!(
                    corpus.edge_index()[edge].contains(&seed.id),
                    "edge {edge} missing seed {}",
                    seed.id
                );
            }
        }
        for (edge, ids) in corpus.edge_index() {
            for id in ids {
                assert!(
                    corpus.seed(*id).unwrap().coverage.contains(edge),
                    "seed {id} indexed under edge {edge} it does not cover"
                );
            }
        }
        assert_eq!(corpus.edge_index()[&2], vec![0, 1]);
    }

    #[test]
    fn save_crash_names_file_after_timestamp_and_origin() {
        let dir = tempdir().unwrap();
        let corpus = corpus_in(dir.path());

        let with_origin = corpus
            .save_crash(b"boom", Some(Path::new("/queue/id_7")))
            .unwrap();
        let name = with_origin.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("crash_"), "{name}");
        assert!(name.ends_with("_id_7"), "{name}");
        assert_eq!(fs::read(&with_origin).unwrap(), b"boom");

        let without_origin = corpus.save_crash(b"bang", None).unwrap();
        let name = without_origin.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("crash_"), "{name}");
        assert!(!name.contains("id_"), "{name}");
    }

    #[test]
    fn set_favoured_overwrites_previous_marks() {
        let dir = tempdir().unwrap();
        let mut corpus = corpus_in(dir.path());
        corpus.admit(b"aaaa", HashSet::from([1]), 0.01).unwrap();
        corpus.admit(b"bbbb", HashSet::from([2]), 0.01).unwrap();

        corpus.set_favoured(&HashSet::from([0]));
        assert!(corpus.seed(0).unwrap().favoured);
        assert!(!corpus.seed(1).unwrap().favoured);

        corpus.set_favoured(&HashSet::from([1]));
        assert!(!corpus.seed(0).unwrap().favoured);
        assert!(corpus.seed(1).unwrap().favoured);
    }

    #[test]
    fn no_temp_files_survive_writes() {
        let dir = tempdir().unwrap();
        let mut corpus = corpus_in(dir.path());
        corpus.admit(b"aaaa", HashSet::from([1]), 0.01).unwrap();
        corpus.save_crash(b"boom", None).unwrap();

        for folder in [dir.path().join("queue"), dir.path().join("crashes")] {
            for entry in fs::read_dir(folder).unwrap() {
                let name = entry.unwrap().file_name();
                assert!(
                    !name.to_string_lossy().ends_with(".tmp"),
                    "leftover temp file {name:?}"
                );
            }
        }
    }
}
