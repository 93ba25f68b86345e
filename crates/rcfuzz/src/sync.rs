use std::fs;
use std::path::Path;

use derive_new::new as New;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::Result;
use crate::fuzzers::FuzzerKind;

/// Cross-pollinates seed corpora between fuzzers. The scheduler treats the
/// call as opaque and blocking.
pub trait SyncService: Send + Sync {
    fn sync(&self, target: &str, fuzzers: &[FuzzerKind], root: &Path) -> Result<()>;
}

/// Production sync: copies each fuzzer's queue into every other fuzzer's
/// `sync/<source>/queue` directory, deduplicated by file name so repeated
/// rounds only move new seeds.
#[derive(Debug, Default, New)]
pub struct QueueSync;

impl SyncService for QueueSync {
    fn sync(&self, target: &str, fuzzers: &[FuzzerKind], root: &Path) -> Result<()> {
        let mut copied = 0usize;
        for source in fuzzers {
            let queue = root
                .join(target)
                .join(source.to_string())
                .join(source.profile().queue_dir);
            if !queue.is_dir() {
                continue;
            }
            let seeds: Vec<_> = WalkDir::new(&queue)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .collect();
            for destination in fuzzers {
                if destination == source {
                    continue;
                }
                let sync_dir = root
                    .join(target)
                    .join(destination.to_string())
                    .join("sync")
                    .join(source.to_string())
                    .join("queue");
                fs::create_dir_all(&sync_dir)?;
                for seed in &seeds {
                    let landing = sync_dir.join(seed.file_name());
                    if landing.exists() {
                        continue;
                    }
                    // Fuzzers rewrite their queues while we copy; a seed
                    // vanishing mid-sync is not an error.
                    match fs::copy(seed.path(), &landing) {
                        Ok(_) => copied += 1,
                        Err(err) => {
                            trace!(seed = %seed.path().display(), %err, "skipping seed")
                        }
                    }
                }
            }
        }
        debug!(copied, "corpus sync finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(root: &Path, target: &str, fuzzer: FuzzerKind, name: &str) {
        let queue = root.join(target).join(fuzzer.to_string()).join("queue");
        fs::create_dir_all(&queue).unwrap();
        fs::write(queue.join(name), name.as_bytes()).unwrap();
    }

    #[test]
    fn copies_seeds_to_all_other_fuzzers() {
        let dir = tempfile::tempdir().unwrap();
        let fuzzers = [FuzzerKind::Afl, FuzzerKind::Mopt];
        seed(dir.path(), "demo", FuzzerKind::Afl, "id:000001");
        seed(dir.path(), "demo", FuzzerKind::Mopt, "id:000042");

        QueueSync.sync("demo", &fuzzers, dir.path()).unwrap();

        let from_afl = dir
            .path()
            .join("demo/mopt/sync/afl/queue/id:000001");
        let from_mopt = dir
            .path()
            .join("demo/afl/sync/mopt/queue/id:000042");
        assert!(from_afl.is_file());
        assert!(from_mopt.is_file());
        // No self-sync.
        assert!(!dir.path().join("demo/afl/sync/afl").exists());
    }

    #[test]
    fn repeated_sync_does_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let fuzzers = [FuzzerKind::Afl, FuzzerKind::Mopt];
        seed(dir.path(), "demo", FuzzerKind::Afl, "id:000001");

        QueueSync.sync("demo", &fuzzers, dir.path()).unwrap();
        let landing = dir.path().join("demo/mopt/sync/afl/queue/id:000001");
        fs::write(&landing, b"mutated-by-destination").unwrap();
        QueueSync.sync("demo", &fuzzers, dir.path()).unwrap();

        assert_eq!(fs::read(&landing).unwrap(), b"mutated-by-destination");
    }

    #[test]
    fn missing_queue_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fuzzers = [FuzzerKind::Afl, FuzzerKind::Mopt];
        QueueSync.sync("demo", &fuzzers, dir.path()).unwrap();
    }
}
