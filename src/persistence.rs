//! Durable session output: the append-only trial log (CSV) and the
//! parameter-exchange file (JSON). Trial rows are flushed as they happen;
//! losing a completed trial to a crash is not acceptable. The exchange
//! file is rewritten durably every time an exchange is recorded, so a
//! crash at any point leaves a replayable seed for the next run. At
//! startup, leftovers from an interrupted run are rotated aside with a
//! timestamp suffix instead of being overwritten.

use crate::session::StimulusKind;
use crate::staircase::Exchange;
use chrono::Local;
use log::info;
use std::{
    borrow::Cow,
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

/// Trial-log header for word sessions. The duplicated `stimulusDuration`
/// column is a wart the analysis scripts already expect; it stays.
pub const WORD_HEADER: &str = "trialNum,disparityAmplitude,stimulusDuration,stimulusDuration,word1,word2,popOutChoice,correct,background,timeStamp";

/// Trial-log header for image sessions.
pub const IMAGE_HEADER: &str = "trialNum,disparityAmplitude,stimulusDuration,stimulusDuration,image1,image2,popOutChoice,correct,background,timeStamp";

/// Sentinel recorded in the background column when backgrounds are off.
pub const NO_BACKGROUND: &str = "none";

/// Errors while reading or writing session files.
#[derive(Debug)]
pub enum PersistenceError {
    /// Filesystem trouble.
    IoError(std::io::Error),
    /// The exchange file exists but does not parse.
    BadExchangeFile(serde_json::Error),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            PersistenceError::IoError(e) => Cow::from(format!("io error: {}", e)),
            PersistenceError::BadExchangeFile(e) => {
                Cow::from(format!("unreadable exchange file: {}", e))
            }
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for PersistenceError {}

impl From<std::io::Error> for PersistenceError {
    fn from(value: std::io::Error) -> Self {
        PersistenceError::IoError(value)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(value: serde_json::Error) -> Self {
        PersistenceError::BadExchangeFile(value)
    }
}

/// One completed trial, constructed after scoring and appended exactly
/// once. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    /// 1-based trial index, gapless within a phase.
    pub trial_num: u32,
    /// Disparity amplitude presented, arcmin.
    pub disparity_amplitude: f64,
    /// Stimulus duration presented, seconds.
    pub stimulus_duration: f64,
    /// Item shown in slot 1 (right).
    pub item1: String,
    /// Item shown in slot 2 (left).
    pub item2: String,
    /// Which class was designated to pop out.
    pub pop_out_choice: String,
    /// 1 if the response was correct, else 0.
    pub correct: u8,
    /// Background file used, or [`NO_BACKGROUND`].
    pub background: String,
    /// Wall-clock stamp, `%H%M%S`.
    pub time_stamp: String,
}

impl TrialRecord {
    /// Stamp the record's completion time from the current wall clock.
    pub fn time_stamp_now() -> String {
        Local::now().format("%H%M%S").to_string()
    }

    /// Render the record the way it appears in the log.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{:.3},{:.3},{},{},{},{},{},{}",
            self.trial_num,
            self.disparity_amplitude,
            self.stimulus_duration,
            self.item1,
            self.item2,
            self.pop_out_choice,
            self.correct,
            self.background,
            self.time_stamp,
        )
    }
}

/// The append-only trial log. Created fresh per run; every append is
/// flushed and synced before the next trial starts.
pub struct TrialLog {
    file: File,
    rows: u32,
}

impl TrialLog {
    /// Create the log and write the header row for this stimulus kind.
    pub fn create(path: &Path, kind: StimulusKind) -> Result<Self, PersistenceError> {
        let mut file = File::create(path)?;
        let header = match kind {
            StimulusKind::Word => WORD_HEADER,
            StimulusKind::Image => IMAGE_HEADER,
        };
        writeln!(file, "{}", header)?;
        file.flush()?;
        Ok(TrialLog { file, rows: 0 })
    }

    /// Append one trial row and push it to disk before returning.
    pub fn append(&mut self, record: &TrialRecord) -> Result<(), PersistenceError> {
        writeln!(self.file, "{}", record.to_csv_line())?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.rows += 1;
        Ok(())
    }

    /// Number of data rows appended so far.
    pub fn rows(&self) -> u32 {
        self.rows
    }
}

/// The parameter-exchange file: a pretty-printed JSON array of exchanges.
/// An absent file is a valid empty sequence.
pub struct ExchangeLog {
    path: PathBuf,
}

impl ExchangeLog {
    /// An exchange log that will live at `path`.
    pub fn new(path: PathBuf) -> Self {
        ExchangeLog { path }
    }

    /// Load the exchange sequence stored at `path`.
    pub fn load(path: &Path) -> Result<Vec<Exchange>, PersistenceError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut raw = String::new();
        File::open(path)?.read_to_string(&mut raw)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist the whole exchange sequence durably: written to a sibling
    /// temp file, synced, then renamed over the target so the file on
    /// disk is always a complete array. Writing an empty sequence is a
    /// no-op, matching the historical files which were only ever created
    /// with content.
    pub fn write(&self, exchanges: &[Exchange]) -> Result<(), PersistenceError> {
        if exchanges.is_empty() {
            return Ok(());
        }
        let raw = serde_json::to_string_pretty(exchanges)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(raw.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Suffix stamp for rotated files.
fn rotation_stamp() -> String {
    Local::now().format("%Y_%m_%d_%Hh_%Mm").to_string()
}

/// If an earlier run left a staircase database under this run's derived
/// name, preserve its files: load the exchange file (the seed for
/// priming), then rename both the database and the exchange file with a
/// timestamp suffix so this run starts on fresh paths. Returns the seed,
/// empty when there was nothing to resume.
pub fn rotate_stale(
    db_path: &Path,
    exchange_path: &Path,
) -> Result<Vec<Exchange>, PersistenceError> {
    if !db_path.exists() {
        return Ok(Vec::new());
    }

    let seed = ExchangeLog::load(exchange_path)?;
    info!(
        "found stale database {}, {} stored exchanges",
        db_path.display(),
        seed.len()
    );

    let stamp = rotation_stamp();
    let rotated_db = db_path.with_file_name(format!(
        "{}_{}.db",
        db_path.file_stem().unwrap_or_default().to_string_lossy(),
        stamp
    ));
    fs::rename(db_path, &rotated_db)?;

    if exchange_path.exists() {
        let rotated_json = exchange_path.with_file_name(format!(
            "{}-{}.json",
            exchange_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy(),
            stamp
        ));
        fs::rename(exchange_path, &rotated_json)?;
    }

    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staircase::TrialConfig;
    use std::io::BufRead;

    fn a_record(trial_num: u32) -> TrialRecord {
        TrialRecord {
            trial_num,
            disparity_amplitude: 12.3456,
            stimulus_duration: 0.789,
            item1: "assets/words/real/glove.png".to_string(),
            item2: "assets/words/nonsense/blorp.png".to_string(),
            pop_out_choice: "real or flower".to_string(),
            correct: 1,
            background: NO_BACKGROUND.to_string(),
            time_stamp: "143015".to_string(),
        }
    }

    fn an_exchange(outcome: u8) -> Exchange {
        Exchange {
            config: TrialConfig::new(0.5, 10.0),
            outcome,
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        let file = File::open(path).unwrap();
        std::io::BufReader::new(file)
            .lines()
            .map(|l| l.unwrap())
            .collect()
    }

    #[test]
    fn log_has_one_header_then_one_row_per_trial_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");

        let mut log = TrialLog::create(&path, StimulusKind::Word).unwrap();
        for i in 1..=3 {
            log.append(&a_record(i)).unwrap();
        }
        assert_eq!(log.rows(), 3);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], WORD_HEADER);
        for (i, line) in lines[1..].iter().enumerate() {
            assert!(line.starts_with(&format!("{},", i + 1)));
        }
    }

    #[test]
    fn header_keeps_the_duplicated_duration_column() {
        assert_eq!(WORD_HEADER.matches("stimulusDuration").count(), 2);
        assert_eq!(IMAGE_HEADER.matches("stimulusDuration").count(), 2);
        assert!(IMAGE_HEADER.contains("image1,image2"));
    }

    #[test]
    fn record_renders_fixed_precision_fields() {
        let line = a_record(7).to_csv_line();
        assert_eq!(
            line,
            "7,12.346,0.789,assets/words/real/glove.png,assets/words/nonsense/blorp.png,real or flower,1,none,143015"
        );
    }

    #[test]
    fn exchange_file_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.json");

        let exchanges = vec![an_exchange(1), an_exchange(0), an_exchange(1)];
        ExchangeLog::new(path.clone()).write(&exchanges).unwrap();

        let loaded = ExchangeLog::load(&path).unwrap();
        assert_eq!(loaded, exchanges);
    }

    #[test]
    fn empty_exchange_write_creates_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.json");
        ExchangeLog::new(path.clone()).write(&[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn absent_exchange_file_is_an_empty_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = ExchangeLog::load(&tmp.path().join("never_written.json")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn rotation_preserves_stale_files_and_returns_the_seed() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("run.db");
        let json = tmp.path().join("run.json");

        fs::write(&db, b"sqlite junk").unwrap();
        ExchangeLog::new(json.clone())
            .write(&[an_exchange(1), an_exchange(0)])
            .unwrap();

        let seed = rotate_stale(&db, &json).unwrap();
        assert_eq!(seed.len(), 2);

        // Originals are gone, rotated copies remain.
        assert!(!db.exists());
        assert!(!json.exists());
        let rotated: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(rotated.iter().any(|n| n.starts_with("run_") && n.ends_with(".db")));
        assert!(rotated.iter().any(|n| n.starts_with("run-") && n.ends_with(".json")));
    }

    #[test]
    fn rotation_without_stale_database_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let seed = rotate_stale(&tmp.path().join("run.db"), &tmp.path().join("run.json")).unwrap();
        assert!(seed.is_empty());
    }

    #[test]
    fn stale_database_without_exchange_file_still_rotates() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("run.db");
        fs::write(&db, b"sqlite junk").unwrap();

        let seed = rotate_stale(&db, &tmp.path().join("run.json")).unwrap();
        assert!(seed.is_empty());
        assert!(!db.exists());
    }
}
