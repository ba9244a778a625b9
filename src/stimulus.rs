//! Stimulus pools and per-trial selection. Each trial shows one
//! target-class item (a real word or a flower) and one foil-class item (a
//! nonsense word or a bird), side by side. Two independent coin flips
//! decide which slot holds the target-class item and which of the two items
//! is the one that pops out; the popped-out item is the only one that
//! carries the horizontal micro-offset, and the correct response key
//! follows from which class popped.

use crate::frontend::{Key, StimulusFrame};
use crate::session::{Location, StimulusKind};
use log::warn;
use rand::{seq::SliceRandom, Rng};
use std::{
    borrow::Cow,
    fmt, fs,
    path::{Path, PathBuf},
};

/// How many reselections to attempt before giving up on a pool whose files
/// keep turning out to be missing on disk.
const MAX_RESELECTS: usize = 32;

/// Directory entries that are not stimuli. Windows drops `Thumbs.db` into
/// image folders and it used to crash trials when selected.
fn is_stale_entry(name: &str) -> bool {
    name.eq_ignore_ascii_case("Thumbs.db") || name == ".DS_Store" || name.starts_with('.')
}

/// Which slot holds the target-class item this trial. Slot 1 is the right
/// position (at +spacing/2), slot 2 the left (at -spacing/2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetSlot {
    /// Target-class item in slot 1 (right).
    Slot1,
    /// Target-class item in slot 2 (left).
    Slot2,
}

/// Which class is designated to pop out this trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PopOut {
    /// The real word / flower pops out; correct answer is [`Key::ChoiceA`].
    Target,
    /// The nonsense word / bird pops out; correct answer is [`Key::ChoiceB`].
    Foil,
}

impl PopOut {
    /// The label recorded in the trial log. Spelled exactly as the
    /// historical data files spell it, typo included.
    pub fn label(&self) -> &'static str {
        match self {
            PopOut::Target => "real or flower",
            PopOut::Foil => "nonesense or bird",
        }
    }
}

/// Errors while loading pools or selecting stimuli.
#[derive(Debug)]
pub enum StimulusError {
    /// A pool directory exists but holds no usable stimuli.
    EmptyPool(PathBuf),
    /// Every reselection attempt landed on a file that is gone from disk.
    MissingAsset(PathBuf),
    /// Io while listing a pool directory.
    IoError(std::io::Error),
}

impl fmt::Display for StimulusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            StimulusError::EmptyPool(dir) => {
                Cow::from(format!("no stimuli found in {}", dir.display()))
            }
            StimulusError::MissingAsset(path) => {
                Cow::from(format!("stimulus file vanished: {}", path.display()))
            }
            StimulusError::IoError(e) => Cow::from(format!("io error: {}", e)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for StimulusError {}

impl From<std::io::Error> for StimulusError {
    fn from(value: std::io::Error) -> Self {
        StimulusError::IoError(value)
    }
}

/// One selected trial's stimulus layout.
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusPair {
    /// Item shown in slot 1 (right).
    pub slot1: PathBuf,
    /// Item shown in slot 2 (left).
    pub slot2: PathBuf,
    /// Which slot holds the target-class item.
    pub target_slot: TargetSlot,
    /// Which class pops out.
    pub pop_out: PopOut,
    /// Horizontal micro-offset on slot 1, degrees. Exactly one of the two
    /// offsets is nonzero.
    pub slot1_offset_deg: f64,
    /// Horizontal micro-offset on slot 2, degrees.
    pub slot2_offset_deg: f64,
    /// The key that scores as correct this trial.
    pub correct_key: Key,
}

impl StimulusPair {
    /// Build the frame handed to the frontend for this pair.
    pub fn frame(&self, disparity_deg: f64, spacing_deg: f64) -> StimulusFrame {
        StimulusFrame {
            slot1: self.slot1.clone(),
            slot2: self.slot2.clone(),
            slot1_offset_deg: self.slot1_offset_deg,
            slot2_offset_deg: self.slot2_offset_deg,
            disparity_deg,
            spacing_deg,
        }
    }
}

/// The target-class and foil-class stimulus pools for a session.
#[derive(Debug, Clone)]
pub struct StimulusPools {
    target: Vec<PathBuf>,
    foil: Vec<PathBuf>,
}

fn list_pool(dir: &Path) -> Result<Vec<PathBuf>, StimulusError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_stale_entry(&name.to_string_lossy()) {
            continue;
        }
        files.push(entry.path());
    }
    if files.is_empty() {
        return Err(StimulusError::EmptyPool(dir.to_owned()));
    }
    files.sort();
    Ok(files)
}

impl StimulusPools {
    /// Scan the asset tree for this session's pools. Words are prerendered
    /// per location and viewing distance; images are shared.
    pub fn load(
        assets_root: &Path,
        kind: StimulusKind,
        location: Location,
        view_distance_cm: u32,
    ) -> Result<Self, StimulusError> {
        let (target_dir, foil_dir) = match kind {
            StimulusKind::Word => (
                assets_root
                    .join("Words")
                    .join(location.dir_name())
                    .join("Real")
                    .join(view_distance_cm.to_string()),
                assets_root
                    .join("Words")
                    .join(location.dir_name())
                    .join("Nonsense")
                    .join(view_distance_cm.to_string()),
            ),
            StimulusKind::Image => (
                assets_root.join("Flowers").join("Cropped Images"),
                assets_root.join("Birds").join("Cropped Images"),
            ),
        };
        Ok(StimulusPools {
            target: list_pool(&target_dir)?,
            foil: list_pool(&foil_dir)?,
        })
    }

    /// Build pools from explicit file lists.
    pub fn from_lists(target: Vec<PathBuf>, foil: Vec<PathBuf>) -> Self {
        StimulusPools { target, foil }
    }

    /// Pick a file from a pool, reselecting while the pick is missing on
    /// disk (stale listings happen when thumbnails or syncing interfere).
    fn pick<R: Rng>(pool: &[PathBuf], rng: &mut R) -> Result<PathBuf, StimulusError> {
        let mut last = None;
        for _ in 0..MAX_RESELECTS {
            let candidate = pool
                .choose(rng)
                .ok_or_else(|| StimulusError::EmptyPool(PathBuf::new()))?;
            if candidate.exists() {
                return Ok(candidate.clone());
            }
            warn!("stimulus {} is missing, reselecting", candidate.display());
            last = Some(candidate.clone());
        }
        Err(StimulusError::MissingAsset(last.unwrap_or_default()))
    }

    /// Select a pair for one trial: a fresh target and foil item (repeats
    /// across trials are fine), a slot for the target class, a pop-out
    /// designation, and the micro-offsets and correct key they imply. The
    /// popped-out item alone gets half the session's horizontal disparity.
    pub fn draw_pair<R: Rng>(
        &self,
        rng: &mut R,
        h_disparity_arcmin: u32,
    ) -> Result<StimulusPair, StimulusError> {
        let target_item = Self::pick(&self.target, rng)?;
        let foil_item = Self::pick(&self.foil, rng)?;

        let target_slot = if rng.gen::<bool>() {
            TargetSlot::Slot1
        } else {
            TargetSlot::Slot2
        };
        let pop_out = if rng.gen::<bool>() {
            PopOut::Target
        } else {
            PopOut::Foil
        };

        let (slot1, slot2) = match target_slot {
            TargetSlot::Slot1 => (target_item, foil_item),
            TargetSlot::Slot2 => (foil_item, target_item),
        };

        // Half the disparity magnitude, arcmin to degrees.
        let offset_deg = (f64::from(h_disparity_arcmin) / 2.0) / 60.0;
        let popped_slot1 = matches!(
            (pop_out, target_slot),
            (PopOut::Target, TargetSlot::Slot1) | (PopOut::Foil, TargetSlot::Slot2)
        );
        let (slot1_offset_deg, slot2_offset_deg) = if popped_slot1 {
            (offset_deg, 0.0)
        } else {
            (0.0, offset_deg)
        };

        let correct_key = match pop_out {
            PopOut::Target => Key::ChoiceA,
            PopOut::Foil => Key::ChoiceB,
        };

        Ok(StimulusPair {
            slot1,
            slot2,
            target_slot,
            pop_out,
            slot1_offset_deg,
            slot2_offset_deg,
            correct_key,
        })
    }
}

/// Pick a background image for the session from a condition directory,
/// skipping stale entries the same way the stimulus pools do.
pub fn select_background<R: Rng>(dir: &Path, rng: &mut R) -> Result<PathBuf, StimulusError> {
    let pool = list_pool(dir)?;
    StimulusPools::pick(&pool, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs::File;

    fn pools_on_disk(tmp: &Path) -> StimulusPools {
        let target = tmp.join("real.png");
        let foil = tmp.join("nonsense.png");
        File::create(&target).unwrap();
        File::create(&foil).unwrap();
        StimulusPools::from_lists(vec![target], vec![foil])
    }

    #[test]
    fn exactly_one_item_carries_the_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let pools = pools_on_disk(tmp.path());
        let mut rng = rand::thread_rng();

        for _ in 0..100 {
            let pair = pools.draw_pair(&mut rng, 5).unwrap();
            let offsets = [pair.slot1_offset_deg, pair.slot2_offset_deg];
            let nonzero: Vec<&f64> = offsets.iter().filter(|o| **o != 0.0).collect();
            assert_eq!(nonzero.len(), 1);
            assert!((*nonzero[0] - (5.0 / 2.0) / 60.0).abs() < 1e-12);
        }
    }

    #[test]
    fn offset_lands_on_the_popped_out_item() {
        let tmp = tempfile::tempdir().unwrap();
        let pools = pools_on_disk(tmp.path());
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let pair = pools.draw_pair(&mut rng, 6).unwrap();
            let popped_slot1 = matches!(
                (pair.pop_out, pair.target_slot),
                (PopOut::Target, TargetSlot::Slot1) | (PopOut::Foil, TargetSlot::Slot2)
            );
            if popped_slot1 {
                assert!(pair.slot1_offset_deg > 0.0 && pair.slot2_offset_deg == 0.0);
            } else {
                assert!(pair.slot2_offset_deg > 0.0 && pair.slot1_offset_deg == 0.0);
            }
        }
    }

    #[test]
    fn correct_key_follows_the_popped_class() {
        let tmp = tempfile::tempdir().unwrap();
        let pools = pools_on_disk(tmp.path());
        let mut rng = rand::thread_rng();

        for _ in 0..100 {
            let pair = pools.draw_pair(&mut rng, 5).unwrap();
            match pair.pop_out {
                PopOut::Target => assert_eq!(pair.correct_key, Key::ChoiceA),
                PopOut::Foil => assert_eq!(pair.correct_key, Key::ChoiceB),
            }
        }
    }

    #[test]
    fn all_four_combinations_are_roughly_balanced() {
        let tmp = tempfile::tempdir().unwrap();
        let pools = pools_on_disk(tmp.path());
        let mut rng = rand::thread_rng();

        let n = 10_000;
        let mut counts: HashMap<(TargetSlot, PopOut), usize> = HashMap::new();
        for _ in 0..n {
            let pair = pools.draw_pair(&mut rng, 5).unwrap();
            *counts.entry((pair.target_slot, pair.pop_out)).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 4);
        for (combo, count) in counts {
            // 4 sigma on a fair 25% binomial at n=10000 is about 173.
            let deviation = (count as f64 - n as f64 / 4.0).abs();
            assert!(
                deviation < 200.0,
                "combination {:?} occurred {} times",
                combo,
                count
            );
        }
    }

    #[test]
    fn missing_file_is_reselected_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let present = tmp.path().join("present.png");
        File::create(&present).unwrap();
        let ghost = tmp.path().join("ghost.png");

        let pools = StimulusPools::from_lists(
            vec![present.clone(), ghost.clone()],
            vec![present.clone()],
        );
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let pair = pools.draw_pair(&mut rng, 5).unwrap();
            assert_ne!(pair.slot1, ghost);
            assert_ne!(pair.slot2, ghost);
        }
    }

    #[test]
    fn pool_of_only_missing_files_errors_out() {
        let pools = StimulusPools::from_lists(
            vec![PathBuf::from("/nowhere/a.png")],
            vec![PathBuf::from("/nowhere/b.png")],
        );
        let mut rng = rand::thread_rng();
        assert!(matches!(
            pools.draw_pair(&mut rng, 5),
            Err(StimulusError::MissingAsset(_))
        ));
    }

    #[test]
    fn pool_listing_skips_thumbnail_droppings() {
        let tmp = tempfile::tempdir().unwrap();
        File::create(tmp.path().join("flower1.png")).unwrap();
        File::create(tmp.path().join("Thumbs.db")).unwrap();
        File::create(tmp.path().join(".DS_Store")).unwrap();

        let pool = list_pool(tmp.path()).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool[0].ends_with("flower1.png"));
    }

    #[test]
    fn empty_directory_is_an_empty_pool_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            list_pool(tmp.path()),
            Err(StimulusError::EmptyPool(_))
        ));
    }

    #[test]
    fn word_pool_paths_follow_the_asset_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("Words/lab/Real/100");
        let nonsense = tmp.path().join("Words/lab/Nonsense/100");
        fs::create_dir_all(&real).unwrap();
        fs::create_dir_all(&nonsense).unwrap();
        File::create(real.join("word1.png")).unwrap();
        File::create(nonsense.join("blorp.png")).unwrap();

        let pools =
            StimulusPools::load(tmp.path(), StimulusKind::Word, Location::Lab, 100).unwrap();
        let mut rng = rand::thread_rng();
        let pair = pools.draw_pair(&mut rng, 5).unwrap();
        let names: Vec<String> = [&pair.slot1, &pair.slot2]
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"word1.png".to_string()));
        assert!(names.contains(&"blorp.png".to_string()));
    }
}
