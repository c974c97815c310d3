//! Content-addressed result cache
//!
//! Layout: `<root>/<hash>/<mode>/<inputBase>_<stem>_<modelId>.wav`
//!
//! An entry is a hit only if every stem of the mode's profile is present and
//! decodes. Anything less is a miss; corrupt entries are logged and treated
//! as absent, never surfaced as errors. Entries are published by renaming a
//! fully written staging directory into place, so a half-written entry is
//! never visible under its final name.
//!
//! In-flight jobs hold a lease on their content hash; the reaper skips leased
//! hashes.

use crate::models::{Mode, SeparationResult, StemResult};
use crate::services::audio_codec;
use crate::services::content_hasher::{self, ContentHash};
use crate::services::metrics;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use stemsync_common::Result;
use tracing::{debug, warn};

/// Prefix of staging directories inside a hash directory
pub const STAGING_PREFIX: &str = ".staging-";

/// Why a lookup missed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// No directory for this hash and mode
    NoEntry,
    /// Directory exists but this stem has no file
    MissingStem(String),
    /// A stem file failed to decode or has the wrong format
    Corrupt(String),
}

/// Cache lookup outcome
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(SeparationResult),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

type LeaseTable = Arc<Mutex<HashMap<String, usize>>>;

/// Keeps a content hash away from the reaper while held
#[derive(Debug)]
pub struct CacheLease {
    table: LeaseTable,
    hash: String,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = table.get_mut(&self.hash) {
            *count -= 1;
            if *count == 0 {
                table.remove(&self.hash);
            }
        }
    }
}

/// Result cache rooted at one directory
#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
    leases: LeaseTable,
}

impl ResultCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_dir(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    /// Final directory of the entry for (hash, mode)
    pub fn entry_dir(&self, hash: &ContentHash, mode: Mode) -> PathBuf {
        self.hash_dir(hash).join(mode.as_str())
    }

    /// Private directory a job writes stems into before publication
    pub fn staging_dir(&self, hash: &ContentHash, mode: Mode, job_id: &str) -> PathBuf {
        self.hash_dir(hash)
            .join(format!("{}{}-{}", STAGING_PREFIX, job_id, mode.as_str()))
    }

    /// Hash `path` and look up its entry for `mode`
    ///
    /// Only I/O errors while hashing are returned as errors.
    pub fn lookup(&self, path: &Path, mode: Mode) -> Result<CacheLookup> {
        let hash = content_hasher::hash_file(path)?;
        Ok(self.lookup_hash(&hash, mode))
    }

    /// Look up the entry for an already computed hash
    pub fn lookup_hash(&self, hash: &ContentHash, mode: Mode) -> CacheLookup {
        let dir = self.entry_dir(hash, mode);
        if !dir.is_dir() {
            return CacheLookup::Miss(MissReason::NoEntry);
        }

        let profile = mode.profile();
        let files = match list_stem_candidates(&dir) {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %dir.display(), "Unreadable cache entry: {}", e);
                return CacheLookup::Miss(MissReason::Corrupt(e.to_string()));
            }
        };

        let mut located = Vec::with_capacity(profile.stems.len());
        for &stem in profile.stems {
            let suffix = format!("_{}_{}.wav", stem, profile.model_id);
            match files.iter().find(|name| name.ends_with(&suffix)) {
                Some(name) => located.push((stem, dir.join(name))),
                None => {
                    debug!(hash = %hash, mode = %mode, stem, "Cache entry missing stem");
                    return CacheLookup::Miss(MissReason::MissingStem(stem.to_string()));
                }
            }
        }

        let mut stems = Vec::with_capacity(located.len());
        for (stem, path) in located {
            let audio = match audio_codec::decode_file(&path) {
                Ok(audio) if audio.sample_rate == profile.sample_rate && !audio.is_empty() => audio,
                Ok(audio) => {
                    warn!(
                        path = %path.display(),
                        sample_rate = audio.sample_rate,
                        "Cached stem has unexpected format; treating as miss"
                    );
                    return CacheLookup::Miss(MissReason::Corrupt(stem.to_string()));
                }
                Err(e) => {
                    warn!(path = %path.display(), "Cached stem unreadable; treating as miss: {:#}", e);
                    return CacheLookup::Miss(MissReason::Corrupt(stem.to_string()));
                }
            };

            let m = metrics::calculate(&audio);
            stems.push(StemResult {
                name: stem.to_string(),
                path: Some(path),
                duration: m.duration,
                rms_db: m.rms_db,
                peak_db: m.peak_db,
            });
        }

        debug!(hash = %hash, mode = %mode, "Cache hit");
        CacheLookup::Hit(SeparationResult {
            stems,
            sample_rate: profile.sample_rate,
            mode,
            content_hash: hash.to_string(),
            cache_hit: true,
            output_dir: dir,
            synthetic: false,
        })
    }

    /// Resolve a stem file for download
    ///
    /// `file_name` must be a plain `.wav` file name inside the entry; anything
    /// that could escape the directory resolves to `None`.
    pub fn stem_file(&self, hash: &ContentHash, mode: Mode, file_name: &str) -> Option<PathBuf> {
        let plain = !file_name.is_empty()
            && !file_name.starts_with('.')
            && !file_name.contains(['/', '\\'])
            && file_name.ends_with(".wav");
        if !plain {
            return None;
        }

        let path = self.entry_dir(hash, mode).join(file_name);
        path.is_file().then_some(path)
    }

    /// Mark `hash` as in use until the lease is dropped
    pub fn lease(&self, hash: &ContentHash) -> CacheLease {
        let mut table = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        *table.entry(hash.to_string()).or_insert(0) += 1;
        CacheLease {
            table: Arc::clone(&self.leases),
            hash: hash.to_string(),
        }
    }

    pub fn is_leased(&self, hash: &str) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(hash)
    }

    /// Run `f` only if `hash` has no lease, keeping new leases out until it returns
    ///
    /// Returns `None` without calling `f` when the hash is leased.
    pub fn with_unleased<R>(&self, hash: &str, f: impl FnOnce() -> R) -> Option<R> {
        let table = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        if table.contains_key(hash) {
            return None;
        }
        let out = f();
        drop(table);
        Some(out)
    }
}

/// Finished `.wav` files in an entry directory (no hidden or partial files)
fn list_stem_candidates(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') && name.ends_with(".wav") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::audio_codec::PcmAudio;
    use tempfile::TempDir;

    fn hash() -> ContentHash {
        ContentHash::parse("00112233aabbccdd").unwrap()
    }

    fn tone(frames: usize) -> PcmAudio {
        let samples = (0..frames * 2)
            .map(|i| ((i / 2) as f32 * 0.05).sin() * 0.5)
            .collect();
        PcmAudio::new(samples, 44100, 2)
    }

    fn populate(cache: &ResultCache, mode: Mode, skip: Option<&str>) -> PathBuf {
        let dir = cache.entry_dir(&hash(), mode);
        std::fs::create_dir_all(&dir).unwrap();
        let profile = mode.profile();
        for &stem in profile.stems {
            if Some(stem) == skip {
                continue;
            }
            let path = dir.join(format!("song_{}_{}.wav", stem, profile.model_id));
            audio_codec::write_wav(&path, &tone(4410)).unwrap();
        }
        dir
    }

    #[test]
    fn test_no_entry() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::new(temp.path().to_path_buf());
        assert!(matches!(
            cache.lookup_hash(&hash(), Mode::Fast),
            CacheLookup::Miss(MissReason::NoEntry)
        ));
    }

    #[test]
    fn test_full_entry_is_hit_in_profile_order() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::new(temp.path().to_path_buf());
        populate(&cache, Mode::Fast, None);

        match cache.lookup_hash(&hash(), Mode::Fast) {
            CacheLookup::Hit(result) => {
                assert!(result.cache_hit);
                assert_eq!(result.stem_names(), vec!["drums", "bass", "other", "vocals"]);
                assert_eq!(result.sample_rate, 44100);
                assert!((result.stems[0].duration - 0.1).abs() < 1e-6);
            }
            other => panic!("expected hit, got {:?}", other),
        }
        // Other mode is independent
        assert!(!cache.lookup_hash(&hash(), Mode::Detailed).is_hit());
    }

    #[test]
    fn test_partial_entry_is_miss() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::new(temp.path().to_path_buf());
        populate(&cache, Mode::Detailed, Some("piano"));

        assert!(matches!(
            cache.lookup_hash(&hash(), Mode::Detailed),
            CacheLookup::Miss(MissReason::MissingStem(ref s)) if s == "piano"
        ));
    }

    #[test]
    fn test_part_files_do_not_count() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::new(temp.path().to_path_buf());
        let dir = populate(&cache, Mode::Fast, Some("vocals"));
        std::fs::write(dir.join("song_vocals_htdemucs.wav.part"), b"partial").unwrap();

        assert!(!cache.lookup_hash(&hash(), Mode::Fast).is_hit());
    }

    #[test]
    fn test_suffix_match_is_strict() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::new(temp.path().to_path_buf());
        let dir = populate(&cache, Mode::Fast, Some("bass"));
        // Detailed model's bass file must not satisfy the fast profile
        audio_codec::write_wav(&dir.join("song_bass_htdemucs_6s.wav"), &tone(100)).unwrap();

        assert!(matches!(
            cache.lookup_hash(&hash(), Mode::Fast),
            CacheLookup::Miss(MissReason::MissingStem(_))
        ));
    }

    #[test]
    fn test_corrupt_stem_is_miss() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::new(temp.path().to_path_buf());
        let dir = populate(&cache, Mode::Fast, None);
        std::fs::write(dir.join("song_drums_htdemucs.wav"), b"garbage").unwrap();

        assert!(matches!(
            cache.lookup_hash(&hash(), Mode::Fast),
            CacheLookup::Miss(MissReason::Corrupt(_))
        ));
    }

    #[test]
    fn test_lookup_by_path_hashes_content() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::new(temp.path().join("outputs"));
        let input = temp.path().join("input.bin");
        std::fs::write(&input, b"abc").unwrap();

        // sha256("abc") prefix
        let expected = ContentHash::parse("ba7816bf8f01cfea").unwrap();
        let dir = cache.entry_dir(&expected, Mode::Fast);
        std::fs::create_dir_all(&dir).unwrap();
        for stem in Mode::Fast.profile().stems {
            audio_codec::write_wav(&dir.join(format!("abc_{}_htdemucs.wav", stem)), &tone(10))
                .unwrap();
        }

        assert!(cache.lookup(&input, Mode::Fast).unwrap().is_hit());
        assert!(cache.lookup(&temp.path().join("missing"), Mode::Fast).is_err());
    }

    #[test]
    fn test_stem_file_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let cache = ResultCache::new(temp.path().to_path_buf());
        populate(&cache, Mode::Fast, None);

        assert!(cache.stem_file(&hash(), Mode::Fast, "song_drums_htdemucs.wav").is_some());
        assert!(cache.stem_file(&hash(), Mode::Fast, "../fast/song_drums_htdemucs.wav").is_none());
        assert!(cache.stem_file(&hash(), Mode::Fast, ".hidden.wav").is_none());
        assert!(cache.stem_file(&hash(), Mode::Fast, "song_drums_htdemucs.mp3").is_none());
        assert!(cache.stem_file(&hash(), Mode::Fast, "absent.wav").is_none());
    }

    #[test]
    fn test_leases_are_counted() {
        let cache = ResultCache::new(PathBuf::from("/unused"));
        let a = cache.lease(&hash());
        let b = cache.lease(&hash());
        assert!(cache.is_leased(hash().as_str()));
        drop(a);
        assert!(cache.is_leased(hash().as_str()));
        drop(b);
        assert!(!cache.is_leased(hash().as_str()));
    }

    #[test]
    fn test_with_unleased_skips_leased_hash() {
        let cache = ResultCache::new(PathBuf::from("/unused"));
        let lease = cache.lease(&hash());

        let mut called = false;
        assert!(cache.with_unleased(hash().as_str(), || called = true).is_none());
        assert!(!called);

        drop(lease);
        assert_eq!(cache.with_unleased(hash().as_str(), || 7), Some(7));
    }

    #[test]
    fn test_lease_waits_for_unleased_removal() {
        use std::sync::mpsc;
        use std::time::Duration;

        let cache = ResultCache::new(PathBuf::from("/unused"));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();

        let remover = {
            let cache = cache.clone();
            let events = events_tx.clone();
            std::thread::spawn(move || {
                cache.with_unleased(hash().as_str(), || {
                    entered_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(200));
                    events.send("removed").unwrap();
                })
            })
        };

        // A job arriving mid-removal only gets its lease afterwards
        entered_rx.recv().unwrap();
        let _lease = cache.lease(&hash());
        events_tx.send("leased").unwrap();

        assert!(remover.join().unwrap().is_some());
        let order: Vec<_> = events_rx.try_iter().collect();
        assert_eq!(order, vec!["removed", "leased"]);
        assert!(cache.is_leased(hash().as_str()));
    }
}
