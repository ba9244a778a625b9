//! The experiment runner. Wires one session together end to end: resolve
//! the configuration, find the participant's binocular offset, launch and
//! prime the staircase server, run the practice and staircase blocks, and
//! wind everything down. The server process is held in a guard, so it is
//! killed on every exit path, panics included.

use clap::Parser;
use log::{info, warn};
use std::error::Error;
use timetofuse::{
    args::Args,
    calibration::{pixels_per_degree, resolve_offset},
    frontend::{Frontend, TerminalFrontend},
    persistence::{rotate_stale, ExchangeLog, TrialLog, NO_BACKGROUND},
    session::SessionDefaults,
    staircase::{ServerProcess, StaircaseClient, DEFAULT_STARTUP_WAIT},
    stimulus::{select_background, StimulusPools},
    trial::TrialRunner,
};

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let defaults = SessionDefaults::load(&args.defaults_file)?;
    let session = args.resolve(&defaults);
    session.validate()?;
    if let Err(e) = Args::remembered(&session).save(&args.defaults_file) {
        warn!("could not remember session defaults: {}", e);
    }
    std::fs::create_dir_all(&args.data_dir)?;

    let ppd = pixels_per_degree(
        session.location.monitor_width_px(),
        session.location.monitor_width_cm(),
        f64::from(session.view_distance_cm),
    );
    info!(
        "session {} for participant {}, {:.2} px/deg",
        session.session_id, session.participant_id, ppd
    );

    let mut frontend = TerminalFrontend::new();
    let offset = resolve_offset(
        &args.ipd_csv,
        &session.participant_id,
        ppd,
        session.mode.mirrored(),
        &mut frontend,
    )?;
    info!(
        "binocular offset: ({:.2}, {:.2}) deg",
        offset.horizontal_deg, offset.vertical_deg
    );

    let mut rng = rand::thread_rng();
    let pools = StimulusPools::load(
        &args.assets_dir,
        session.stimulus,
        session.location,
        session.view_distance_cm,
    )?;
    let background = match session.background.dir_name() {
        Some(dir) => {
            let picked =
                select_background(&args.assets_dir.join("Backgrounds").join(dir), &mut rng)?;
            info!("background: {}", picked.display());
            picked.display().to_string()
        }
        None => NO_BACKGROUND.to_string(),
    };

    // An interrupted run under the same derived name gets its files
    // rotated aside; its exchanges seed the new server's model.
    let seed = rotate_stale(
        &session.database_path(),
        &session.exchange_path(&args.data_dir),
    )?;

    let mut server = ServerProcess::launch(&args.server_cmd, &args.server_args)?;
    let mut client = StaircaseClient::connect(
        &args.server_addr,
        DEFAULT_STARTUP_WAIT,
        args.server_io_timeout(),
    )?;
    client.prime(&seed)?;

    let mut log = TrialLog::create(&session.trial_log_path(&args.data_dir), session.stimulus)?;
    let exchange_log = ExchangeLog::new(session.exchange_path(&args.data_dir));

    let mut runner = TrialRunner::new(&session, &mut frontend, &pools, rng, background);

    let mut carry_on = true;
    if session.practice {
        carry_on = runner.run_practice(&mut log)?;
    }
    if carry_on && runner.begin_gate("Press the spacebar to begin")? {
        runner.run_staircase(&mut client, &exchange_log, &mut log)?;
    }

    exchange_log.write(client.exchanges())?;
    client.finish();
    server.shutdown();
    frontend.show_text("Thank you! The session is over.")?;
    info!("session done: {} trials logged", log.rows());
    Ok(())
}
