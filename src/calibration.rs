//! Per-subject binocular centering offsets. The haploscope calibration
//! procedure writes one row per measurement into `ipd_correction.csv`; this
//! module reads that table back, averages the rows from a subject's most
//! recent session, and converts between pixel and degree units. When a
//! subject has no calibration history at all, a quicker interactive
//! alignment (nudge a plus symbol into a circle) stands in, and its result
//! is appended to the table so the next session can skip it.

use crate::frontend::{Frontend, FrontendError, Key};
use log::{info, warn};
use nom::{
    bytes::complete::take_till,
    character::complete::{char, u32 as nom_u32},
    combinator::map,
    error::Error,
    number::complete::double,
    sequence::{preceded, tuple},
    Finish, IResult,
};
use rand::Rng;
use std::{
    borrow::Cow,
    f64::consts::PI,
    fmt,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::Path,
    str::FromStr,
};

/// Starting vertical offset for the interactive fallback, degrees.
const INITIAL_OFFSET_VERTICAL: f64 = -1.8;
/// Starting horizontal offset for the interactive fallback, degrees.
const INITIAL_OFFSET_HORIZONTAL: f64 = -1.1;
/// Adjustment step per key event, degrees.
const ADJUST_STEP: f64 = 0.1;

/// Whether an offset is expressed in pixels or degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Units {
    /// Screen pixels.
    Pix,
    /// Degrees of visual angle.
    Deg,
}

/// Things that can go wrong while resolving a calibration offset.
#[derive(Debug)]
pub enum CalibrationError {
    /// The table holds no rows for the requested subject; the mean over an
    /// empty set is undefined, so this is an error state rather than a NaN.
    NoRecord(String),
    /// A row in the table did not parse.
    BadRow(String),
    /// Io while reading or appending the table.
    IoError(std::io::Error),
    /// The interactive fallback failed at the display boundary.
    FrontendError(FrontendError),
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            CalibrationError::NoRecord(subject) => {
                Cow::from(format!("no calibration rows for subject {}", subject))
            }
            CalibrationError::BadRow(row) => {
                Cow::from(format!("unparseable calibration row: {}", row))
            }
            CalibrationError::IoError(e) => Cow::from(format!("io error: {}", e)),
            CalibrationError::FrontendError(e) => Cow::from(format!("frontend error: {}", e)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for CalibrationError {}

impl From<std::io::Error> for CalibrationError {
    fn from(value: std::io::Error) -> Self {
        CalibrationError::IoError(value)
    }
}

impl From<FrontendError> for CalibrationError {
    fn from(value: FrontendError) -> Self {
        CalibrationError::FrontendError(value)
    }
}

/// One row of `ipd_correction.csv`: a subject, the session the measurement
/// came from, and the horizontal/vertical corrections in both unit systems.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRow {
    /// Subject the measurement belongs to.
    pub subject_name: String,
    /// Session counter, monotonically increasing per subject.
    pub session: u32,
    /// Horizontal correction, pixels.
    pub pix_horizontal: f64,
    /// Vertical correction, pixels.
    pub pix_vertical: f64,
    /// Horizontal correction, degrees.
    pub deg_horizontal: f64,
    /// Vertical correction, degrees.
    pub deg_vertical: f64,
}

fn parse_row(s: &str) -> IResult<&str, CalibrationRow> {
    map(
        tuple((
            map(take_till(|c| c == ','), |name: &str| name.to_owned()),
            preceded(char(','), nom_u32),
            preceded(char(','), double),
            preceded(char(','), double),
            preceded(char(','), double),
            preceded(char(','), double),
        )),
        |(subject_name, session, pix_horizontal, pix_vertical, deg_horizontal, deg_vertical)| {
            CalibrationRow {
                subject_name,
                session,
                pix_horizontal,
                pix_vertical,
                deg_horizontal,
                deg_vertical,
            }
        },
    )(s)
}

impl FromStr for CalibrationRow {
    type Err = Error<String>;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_row(s.trim()).finish() {
            Ok((_remaining, row)) => Ok(row),
            Err(Error { input, code }) => Err(Error {
                input: input.to_string(),
                code,
            }),
        }
    }
}

impl CalibrationRow {
    /// Render the row the way it appears in the table.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.subject_name,
            self.session,
            self.pix_horizontal,
            self.pix_vertical,
            self.deg_horizontal,
            self.deg_vertical,
        )
    }
}

/// The header line written when a fresh table is created.
pub const TABLE_HEADER: &str = "subject_name,session,ipd_correction_pix_horizontal,ipd_correction_pix_vertical,ipd_correction_deg_horizontal,ipd_correction_deg_vertical";

/// The whole calibration table, loaded into memory.
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    rows: Vec<CalibrationRow>,
}

impl CalibrationTable {
    /// Build a table from rows already in hand.
    pub fn from_rows(rows: Vec<CalibrationRow>) -> Self {
        CalibrationTable { rows }
    }

    /// Load the table from disk. The first line is assumed to be the
    /// header; an absent file is an empty table.
    pub fn from_path(path: &Path) -> Result<Self, CalibrationError> {
        if !path.exists() {
            return Ok(CalibrationTable::default());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut rows = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if i == 0 || line.trim().is_empty() {
                continue;
            }
            let row = line
                .parse::<CalibrationRow>()
                .map_err(|_| CalibrationError::BadRow(line.clone()))?;
            rows.push(row);
        }
        Ok(CalibrationTable { rows })
    }

    /// Mean (horizontal, vertical) offset for `subject_name` in `units`,
    /// averaged over exactly the rows of that subject's most recent
    /// session. Errors with [`CalibrationError::NoRecord`] when the subject
    /// has no rows at all.
    pub fn binocular_offset(
        &self,
        subject_name: &str,
        units: Units,
    ) -> Result<(f64, f64), CalibrationError> {
        let subject_rows: Vec<&CalibrationRow> = self
            .rows
            .iter()
            .filter(|r| r.subject_name == subject_name)
            .collect();

        let max_session = subject_rows
            .iter()
            .map(|r| r.session)
            .max()
            .ok_or_else(|| CalibrationError::NoRecord(subject_name.to_owned()))?;

        let recent: Vec<&&CalibrationRow> = subject_rows
            .iter()
            .filter(|r| r.session == max_session)
            .collect();

        let n = recent.len() as f64;
        let (h_sum, v_sum) = recent.iter().fold((0.0, 0.0), |(h, v), r| match units {
            Units::Pix => (h + r.pix_horizontal, v + r.pix_vertical),
            Units::Deg => (h + r.deg_horizontal, v + r.deg_vertical),
        });

        Ok((h_sum / n, v_sum / n))
    }

    /// Next session number for a subject (1 for a new subject).
    pub fn next_session(&self, subject_name: &str) -> u32 {
        self.rows
            .iter()
            .filter(|r| r.subject_name == subject_name)
            .map(|r| r.session)
            .max()
            .map_or(1, |s| s + 1)
    }
}

/// Append a calibration row to the table on disk, writing the header first
/// when the file does not exist yet.
pub fn append_row(path: &Path, row: &CalibrationRow) -> Result<(), CalibrationError> {
    let fresh = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if fresh {
        writeln!(file, "{}", TABLE_HEADER)?;
    }
    writeln!(file, "{}", row.to_csv_line())?;
    file.flush()?;
    Ok(())
}

/// Pixels per degree of visual angle for a monitor of `width_px` pixels and
/// `width_cm` centimeters viewed from `view_distance_cm`.
pub fn pixels_per_degree(width_px: u32, width_cm: f64, view_distance_cm: f64) -> f64 {
    PI * f64::from(width_px) / (width_cm / view_distance_cm / 2.0).atan() / 360.0
}

/// A resolved centering correction, fixed for the session. Pixels are the
/// stored unit; degrees are derived through pixels-per-degree so the same
/// correction holds at any viewing distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinocularOffset {
    /// Horizontal correction, pixels.
    pub horizontal_px: f64,
    /// Vertical correction, pixels.
    pub vertical_px: f64,
    /// Horizontal correction, degrees.
    pub horizontal_deg: f64,
    /// Vertical correction, degrees.
    pub vertical_deg: f64,
}

impl BinocularOffset {
    /// Build from a pixel offset and a pixels-per-degree factor.
    pub fn from_pixels(h_px: f64, v_px: f64, ppd: f64) -> Self {
        BinocularOffset {
            horizontal_px: h_px,
            vertical_px: v_px,
            horizontal_deg: h_px / ppd,
            vertical_deg: v_px / ppd,
        }
    }

    /// Build from a degree offset and a pixels-per-degree factor.
    pub fn from_degrees(h_deg: f64, v_deg: f64, ppd: f64) -> Self {
        BinocularOffset {
            horizontal_px: h_deg * ppd,
            vertical_px: v_deg * ppd,
            horizontal_deg: h_deg,
            vertical_deg: v_deg,
        }
    }
}

/// Resolve the offset for this session: use the table when the subject has
/// history, otherwise run the interactive fallback and persist its result
/// as a fresh calibration row.
pub fn resolve_offset<F: Frontend>(
    table_path: &Path,
    subject_name: &str,
    ppd: f64,
    mirrored: bool,
    frontend: &mut F,
) -> Result<BinocularOffset, CalibrationError> {
    let table = CalibrationTable::from_path(table_path)?;
    match table.binocular_offset(subject_name, Units::Pix) {
        Ok((h_px, v_px)) => {
            info!(
                "calibration found for {}: ({:.1}, {:.1}) px",
                subject_name, h_px, v_px
            );
            Ok(BinocularOffset::from_pixels(h_px, v_px, ppd))
        }
        Err(CalibrationError::NoRecord(_)) => {
            warn!(
                "no calibration rows for {}, falling back to manual alignment",
                subject_name
            );
            let offset = manual_adjustment(frontend, mirrored, ppd)?;
            let row = CalibrationRow {
                subject_name: subject_name.to_owned(),
                session: table.next_session(subject_name),
                pix_horizontal: offset.horizontal_px,
                pix_vertical: offset.vertical_px,
                deg_horizontal: offset.horizontal_deg,
                deg_vertical: offset.vertical_deg,
            };
            append_row(table_path, &row)?;
            Ok(offset)
        }
        Err(e) => Err(e),
    }
}

/// The interactive alignment: the participant nudges a plus symbol into a
/// circle with the arrow keys, 0.1 degrees per press, and confirms with
/// space. The starting point is jittered so the participant cannot just
/// confirm without looking.
pub fn manual_adjustment<F: Frontend>(
    frontend: &mut F,
    mirrored: bool,
    ppd: f64,
) -> Result<BinocularOffset, CalibrationError> {
    let mut rng = rand::thread_rng();
    let jitter = |rng: &mut rand::rngs::ThreadRng| (rng.gen_range(-10i32..=10) as f64) / 10.0;

    let mut horizontal = INITIAL_OFFSET_HORIZONTAL + jitter(&mut rng);
    let mut vertical = INITIAL_OFFSET_VERTICAL + jitter(&mut rng);
    info!("initial manual offset: ({:.1}, {:.1}) deg", horizontal, vertical);

    loop {
        frontend.show_alignment(horizontal, vertical)?;
        match frontend.wait_key(&[Key::Up, Key::Down, Key::Left, Key::Right, Key::Confirm])? {
            Key::Up => vertical += ADJUST_STEP,
            Key::Down => vertical -= ADJUST_STEP,
            // Arrow direction flips when the right eye's image is mirrored.
            Key::Left => horizontal += if mirrored { ADJUST_STEP } else { -ADJUST_STEP },
            Key::Right => horizontal += if mirrored { -ADJUST_STEP } else { ADJUST_STEP },
            Key::Confirm => break,
            _ => {}
        }
    }

    info!("manual offset confirmed: ({:.1}, {:.1}) deg", horizontal, vertical);
    Ok(BinocularOffset::from_degrees(horizontal, vertical, ppd))
}
