//! Command line surface. Session parameters are all optional on the
//! command line; anything not given falls back to the value remembered
//! from the previous run (and those to built-in defaults), so day-to-day
//! use in the lab is just rerunning the binary with the participant id.

use crate::session::{BackgroundKind, Difficulty, Location, Mode, Session, SessionDefaults, StimulusKind};
use crate::staircase::DEFAULT_SERVER_ADDR;
use clap::Parser;
use std::{path::PathBuf, time::Duration};

/// Binocular fusion-time experiment runner.
#[derive(Debug, Parser)]
#[command(name = "timetofuse")]
pub struct Args {
    /// Participant identifier.
    #[arg(long)]
    pub participant: Option<String>,

    /// Viewing distance in centimeters.
    #[arg(long)]
    pub vid: Option<u32>,

    /// Horizontal disparity magnitude in arcmin; the popped-out item
    /// carries half of this per eye.
    #[arg(long)]
    pub disparity: Option<u32>,

    /// Gap between the two stimuli in degrees.
    #[arg(long)]
    pub spacing: Option<u32>,

    /// Word or image stimuli.
    #[arg(long, value_enum)]
    pub stimulus: Option<StimulusKind>,

    /// Desk or lab apparatus.
    #[arg(long, value_enum)]
    pub location: Option<Location>,

    /// Debug (single screen) or test (haploscope) mode.
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Background condition behind the stimuli.
    #[arg(long, value_enum)]
    pub background: Option<BackgroundKind>,

    /// Run the practice block even if the remembered default says not to.
    #[arg(long, conflicts_with = "no_practice")]
    pub practice: bool,

    /// Skip the practice block.
    #[arg(long)]
    pub no_practice: bool,

    /// Practice difficulty.
    #[arg(long, value_enum, default_value = "easy")]
    pub difficulty: Difficulty,

    /// Root of the stimulus asset tree.
    #[arg(long, default_value = "assets")]
    pub assets_dir: PathBuf,

    /// Directory the trial log and exchange file are written into.
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Calibration table of per-subject centering offsets.
    #[arg(long, default_value = "ipd_correction.csv")]
    pub ipd_csv: PathBuf,

    /// File the previous run's parameters are remembered in.
    #[arg(long, default_value = "last_session.ron")]
    pub defaults_file: PathBuf,

    /// Command that launches the staircase server.
    #[arg(long, default_value = "python")]
    pub server_cmd: String,

    /// Argument passed to the server command; repeat for more.
    #[arg(long = "server-arg")]
    pub server_args: Vec<String>,

    /// Address the staircase server listens on.
    #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
    pub server_addr: String,

    /// Per-response timeout on the server socket, in seconds. Zero means
    /// wait indefinitely, which is how the apparatus historically ran.
    #[arg(long, default_value_t = 0)]
    pub server_timeout_s: u64,
}

impl Args {
    /// Build this run's session: explicit flags win, remembered defaults
    /// fill the rest, and the session id is stamped from the clock.
    pub fn resolve(&self, defaults: &SessionDefaults) -> Session {
        let practice = if self.practice {
            true
        } else if self.no_practice {
            false
        } else {
            defaults.practice
        };
        Session {
            participant_id: self
                .participant
                .clone()
                .unwrap_or_else(|| defaults.participant_id.clone()),
            view_distance_cm: self.vid.unwrap_or(defaults.view_distance_cm),
            stimulus: self.stimulus.unwrap_or(defaults.stimulus),
            h_disparity_arcmin: self.disparity.unwrap_or(defaults.h_disparity_arcmin),
            stim_spacing_deg: self.spacing.unwrap_or(defaults.stim_spacing_deg),
            background: self.background.unwrap_or(defaults.background),
            location: self.location.unwrap_or(defaults.location),
            mode: self.mode.unwrap_or(defaults.mode),
            practice,
            difficulty: self.difficulty,
            session_id: Session::stamp_id(),
        }
    }

    /// The defaults to remember for the next run, taken from the resolved
    /// session.
    pub fn remembered(session: &Session) -> SessionDefaults {
        SessionDefaults {
            participant_id: session.participant_id.clone(),
            view_distance_cm: session.view_distance_cm,
            h_disparity_arcmin: session.h_disparity_arcmin,
            stim_spacing_deg: session.stim_spacing_deg,
            stimulus: session.stimulus,
            location: session.location,
            mode: session.mode,
            background: session.background,
            practice: session.practice,
        }
    }

    /// Socket timeout for the staircase conversation.
    pub fn server_io_timeout(&self) -> Option<Duration> {
        if self.server_timeout_s == 0 {
            None
        } else {
            Some(Duration::from_secs(self.server_timeout_s))
        }
    }
}
