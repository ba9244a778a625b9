//! Session-level configuration for one run of the task. A [`Session`] is
//! built once at startup from the command line (and the remembered defaults
//! from the previous run), validated, and read-only from then on. The
//! session id is derived from the wall-clock start time and is baked into
//! every file name this run produces.

use chrono::Local;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

/// Background pattern contrast. Fixed for the whole apparatus; recorded in
/// the derived data-file name so sessions with different contrasts never
/// collide.
pub const BG_CONTRAST: f64 = 0.5;

/// Image stimulus height in degrees (image mode only).
pub const IMAGE_SIZE_DEG: f64 = 5.0;

/// Whether stimuli are prerendered word images or object photographs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum StimulusKind {
    /// Real vs. nonsense word images, prerendered per viewing distance.
    Word,
    /// Flower vs. bird photographs.
    Image,
}

impl StimulusKind {
    /// One-letter code used in the derived data-file name.
    pub fn code(&self) -> &'static str {
        match self {
            StimulusKind::Word => "w",
            StimulusKind::Image => "i",
        }
    }
}

/// Where the apparatus is set up. Selects monitor geometry and which
/// prerendered word sets are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Location {
    /// Development machine, single monitor.
    Desk,
    /// The haploscope in the lab.
    Lab,
}

impl Location {
    /// Asset subdirectory name for this location.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Location::Desk => "desk",
            Location::Lab => "lab",
        }
    }

    /// Stimulus monitor width in pixels.
    pub fn monitor_width_px(&self) -> u32 {
        match self {
            Location::Desk => 2560,
            Location::Lab => 4096,
        }
    }

    /// Stimulus monitor physical width in centimeters.
    pub fn monitor_width_cm(&self) -> f64 {
        match self {
            Location::Desk => 40.0,
            Location::Lab => 69.85,
        }
    }
}

/// Debug runs everything on one screen; test drives the full haploscope
/// with mirrored stimulus presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Mode {
    /// Single-monitor development mode.
    Debug,
    /// Haploscope mode; the right-eye image is mirrored.
    Test,
}

impl Mode {
    /// Whether right-eye stimuli are drawn horizontally mirrored.
    pub fn mirrored(&self) -> bool {
        matches!(self, Mode::Test)
    }

    /// Label used in the derived data-file name.
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Debug => "debug",
            Mode::Test => "test",
        }
    }
}

/// Background noise condition behind the stimuli.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum BackgroundKind {
    /// No background pattern.
    Off,
    /// 1/f noise patches.
    PinkNoise,
    /// Dead-leaves patches.
    DeadLeaves,
}

impl BackgroundKind {
    /// Asset subdirectory name, or `None` when backgrounds are off.
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            BackgroundKind::Off => None,
            BackgroundKind::PinkNoise => Some("pinknoise"),
            BackgroundKind::DeadLeaves => Some("deadleaves"),
        }
    }

    /// Label used in the derived data-file name.
    pub fn label(&self) -> &'static str {
        match self {
            BackgroundKind::Off => "off",
            BackgroundKind::PinkNoise => "pinknoise",
            BackgroundKind::DeadLeaves => "deadleaves",
        }
    }
}

/// Practice difficulty. Only affects locally drawn practice parameters;
/// staircase trials are always server-controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Difficulty {
    /// Longer durations, smaller disparities.
    Easy,
    /// Shorter durations, larger disparities.
    Hard,
}

impl Difficulty {
    /// Range of stimulus durations (seconds) for practice trials.
    pub fn duration_range(&self) -> (f64, f64) {
        match self {
            Difficulty::Easy => (0.5, 2.0),
            Difficulty::Hard => (0.25, 1.5),
        }
    }

    /// Range of disparity amplitudes (arcmin) for practice trials.
    pub fn disparity_range(&self) -> (f64, f64) {
        match self {
            Difficulty::Easy => (0.0, 20.0),
            Difficulty::Hard => (15.0, 60.0),
        }
    }
}

/// Something about the requested session makes it unrunnable. Fatal before
/// any trial runs.
#[derive(Debug)]
pub enum ConfigError {
    /// View distance must be positive to make visual-angle math meaningful.
    BadViewDistance(u32),
    /// Disparity magnitude of zero would make every trial unanswerable.
    BadDisparity(u32),
    /// The defaults file exists but could not be read or parsed.
    BadDefaultsFile(String),
    /// Io while touching the defaults file.
    IoError(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::BadViewDistance(vid) => {
                Cow::from(format!("view distance must be > 0, got {}", vid))
            }
            ConfigError::BadDisparity(d) => {
                Cow::from(format!("horizontal disparity must be > 0, got {}", d))
            }
            ConfigError::BadDefaultsFile(e) => {
                Cow::from(format!("defaults file unreadable: {}", e))
            }
            ConfigError::IoError(e) => Cow::from(format!("io error: {}", e)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::IoError(value)
    }
}

/// One experiment run for one participant. Created once at startup,
/// read-only thereafter.
#[derive(Debug, Clone)]
pub struct Session {
    /// Participant identifier (free-form, usually a number).
    pub participant_id: String,
    /// Viewing distance in centimeters.
    pub view_distance_cm: u32,
    /// Word or image stimuli.
    pub stimulus: StimulusKind,
    /// Horizontal disparity magnitude in arcmin; the popped-out item gets
    /// half of this applied per eye.
    pub h_disparity_arcmin: u32,
    /// Gap between the two stimuli in degrees.
    pub stim_spacing_deg: u32,
    /// Background condition.
    pub background: BackgroundKind,
    /// Desk or lab apparatus.
    pub location: Location,
    /// Debug or test mode.
    pub mode: Mode,
    /// Whether to run the practice block first.
    pub practice: bool,
    /// Practice difficulty.
    pub difficulty: Difficulty,
    /// Wall-clock-derived id, unique per run, fixed after creation.
    pub session_id: String,
}

impl Session {
    /// Stamp a session id from the current wall-clock time.
    pub fn stamp_id() -> String {
        Local::now().format("%Y-%m-%d-%H%M").to_string()
    }

    /// Validate the numeric parameters that the rest of the run divides by.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.view_distance_cm == 0 {
            return Err(ConfigError::BadViewDistance(self.view_distance_cm));
        }
        if self.h_disparity_arcmin == 0 {
            return Err(ConfigError::BadDisparity(self.h_disparity_arcmin));
        }
        Ok(())
    }

    /// Base name shared by the trial log, the exchange file and the
    /// staircase database. Encodes every parameter that distinguishes
    /// sessions, ending with the session id.
    pub fn data_base_name(&self) -> String {
        let size_part = match self.stimulus {
            StimulusKind::Word => "_XHeight_24arcmin_".to_string(),
            StimulusKind::Image => format!("_ImageHeight_{}", IMAGE_SIZE_DEG),
        };
        format!(
            "MargaretRiver_TTFuse_PPT{}_VID_{}_StimType_{}_Spacing_{}_HorDisparity_{}{}_Background_{}_bgContrast_{}_{}_{}_{}",
            self.participant_id,
            self.view_distance_cm,
            self.stimulus.code(),
            self.stim_spacing_deg,
            self.h_disparity_arcmin,
            size_part,
            self.background.label(),
            BG_CONTRAST,
            self.location.dir_name(),
            self.mode.label(),
            self.session_id,
        )
    }

    /// Path of this run's trial log inside `data_dir`.
    pub fn trial_log_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.csv", self.data_base_name()))
    }

    /// Path of this run's parameter-exchange file inside `data_dir`.
    pub fn exchange_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.json", self.data_base_name()))
    }

    /// Path of the staircase server's database file. The server creates
    /// this next to the working directory rather than under `data_dir`;
    /// deep paths have broken database creation before.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.db", self.data_base_name()))
    }
}

/// The session parameters remembered from the previous run, offered as
/// defaults for the next one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDefaults {
    /// Last participant id.
    pub participant_id: String,
    /// Last viewing distance in cm.
    pub view_distance_cm: u32,
    /// Last horizontal disparity in arcmin.
    pub h_disparity_arcmin: u32,
    /// Last stimulus spacing in degrees.
    pub stim_spacing_deg: u32,
    /// Last stimulus kind.
    pub stimulus: StimulusKind,
    /// Last location.
    pub location: Location,
    /// Last mode.
    pub mode: Mode,
    /// Last background condition.
    pub background: BackgroundKind,
    /// Whether practice was on.
    pub practice: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        SessionDefaults {
            participant_id: "999".to_string(),
            view_distance_cm: 57,
            h_disparity_arcmin: 5,
            stim_spacing_deg: 8,
            stimulus: StimulusKind::Word,
            location: Location::Desk,
            mode: Mode::Debug,
            background: BackgroundKind::Off,
            practice: true,
        }
    }
}

impl SessionDefaults {
    /// Load remembered defaults; an absent file just means the built-in
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(SessionDefaults::default());
        }
        let mut raw = String::new();
        File::open(path)?.read_to_string(&mut raw)?;
        ron::de::from_str(&raw).map_err(|e| ConfigError::BadDefaultsFile(e.to_string()))
    }

    /// Persist these parameters as the defaults for the next run.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = ron::ser::to_string(self)
            .map_err(|e| ConfigError::BadDefaultsFile(e.to_string()))?;
        File::create(path)?.write_all(raw.as_bytes())?;
        Ok(())
    }
}
