//! Look up a subject's binocular centering offset from the calibration
//! table, averaged over their most recent calibration session. Handy for
//! checking what the runner will use before seating a participant.

use clap::Parser;
use std::path::PathBuf;
use timetofuse::calibration::{CalibrationTable, Units};

/// Report a subject's stored binocular offset.
#[derive(Debug, Parser)]
#[command(name = "binocular_offset")]
struct OffsetArgs {
    /// Subject to look up.
    subject_name: String,

    /// Calibration table of per-subject centering offsets.
    #[arg(long, default_value = "ipd_correction.csv")]
    ipd_csv: PathBuf,

    /// Units to report in.
    #[arg(long, value_enum, default_value = "pix")]
    units: Units,
}

fn main() {
    env_logger::init();
    let args = OffsetArgs::parse();

    let result = CalibrationTable::from_path(&args.ipd_csv)
        .and_then(|table| table.binocular_offset(&args.subject_name, args.units));
    match result {
        Ok((horizontal, vertical)) => {
            println!("Horizontal: {}", horizontal);
            println!("Vertical: {}", vertical);
        }
        Err(e) => {
            eprintln!("fatal: {}", e);
            std::process::exit(1);
        }
    }
}
