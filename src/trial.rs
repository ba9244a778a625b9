//! The trial control loop. A single [`TrialRunner`] drives both phases of
//! a session: the optional practice block, whose parameters are drawn
//! locally, and the main block, whose parameters come from the staircase
//! server one ask at a time. Both phases present trials through the same
//! [`run_trial`](TrialRunner::run_trial) path, so timing, scoring and
//! logging cannot drift between them.

use crate::frontend::{Frontend, FrontendError, Key};
use crate::persistence::{ExchangeLog, PersistenceError, TrialLog, TrialRecord};
use crate::session::{Session, StimulusKind};
use crate::staircase::{ProtocolError, StaircaseClient};
use crate::stimulus::{StimulusError, StimulusPair, StimulusPools};
use log::info;
use rand::Rng;
use std::{
    borrow::Cow,
    fmt,
    time::{Duration, Instant},
};

/// Length of the practice block.
pub const NUM_PRACTICE_TRIALS: u32 = 100;

/// Shown before the practice block starts.
const PRACTICE_INSTRUCTIONS: &str = "Practice block: one of the two items will pop out in depth. \
Press 1 if it was the left-response item, 3 if it was the right-response item. \
Press the spacebar to start each trial, q to leave.";

fn reminder_text(kind: StimulusKind) -> &'static str {
    match kind {
        StimulusKind::Word => "left = real word, right = nonsense word",
        StimulusKind::Image => "left = flower, right = bird",
    }
}

/// Anything that can end a run early. Persistence has already captured
/// every completed trial by the time one of these propagates.
#[derive(Debug)]
pub enum TrialError {
    /// The staircase conversation failed.
    Protocol(ProtocolError),
    /// The display or input layer failed.
    Frontend(FrontendError),
    /// Stimulus selection failed.
    Stimulus(StimulusError),
    /// A trial row or exchange could not be written.
    Persistence(PersistenceError),
}

impl fmt::Display for TrialError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            TrialError::Protocol(e) => Cow::from(format!("staircase protocol: {}", e)),
            TrialError::Frontend(e) => Cow::from(format!("frontend: {}", e)),
            TrialError::Stimulus(e) => Cow::from(format!("stimulus selection: {}", e)),
            TrialError::Persistence(e) => Cow::from(format!("persistence: {}", e)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for TrialError {}

impl From<ProtocolError> for TrialError {
    fn from(value: ProtocolError) -> Self {
        TrialError::Protocol(value)
    }
}

impl From<FrontendError> for TrialError {
    fn from(value: FrontendError) -> Self {
        TrialError::Frontend(value)
    }
}

impl From<StimulusError> for TrialError {
    fn from(value: StimulusError) -> Self {
        TrialError::Stimulus(value)
    }
}

impl From<PersistenceError> for TrialError {
    fn from(value: PersistenceError) -> Self {
        TrialError::Persistence(value)
    }
}

/// Everything one trial needs, assembled before the trial starts. Nothing
/// here is shared or mutated across trials.
#[derive(Debug, Clone)]
pub struct TrialContext {
    /// 1-based index within the current phase.
    pub trial_num: u32,
    /// Stimulus duration, seconds.
    pub duration_s: f64,
    /// Vertical disparity amplitude, arcmin.
    pub disparity_arcmin: f64,
    /// The selected stimulus pair.
    pub pair: StimulusPair,
}

/// How a trial ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialOutcome {
    /// The participant answered; 1 if correct, else 0.
    Completed(u8),
    /// The participant pressed quit; the run winds down.
    Quit,
}

/// Drives trials against a frontend. One runner serves a whole session.
pub struct TrialRunner<'a, F: Frontend, R: Rng> {
    session: &'a Session,
    frontend: &'a mut F,
    pools: &'a StimulusPools,
    rng: R,
    background: String,
    pacer: fn(Duration),
}

impl<'a, F: Frontend, R: Rng> TrialRunner<'a, F, R> {
    /// A runner for this session. `background` is what gets recorded in
    /// the trial log's background column.
    pub fn new(
        session: &'a Session,
        frontend: &'a mut F,
        pools: &'a StimulusPools,
        rng: R,
        background: String,
    ) -> Self {
        TrialRunner {
            session,
            frontend,
            pools,
            rng,
            background,
            pacer: spin_sleep::sleep,
        }
    }

    /// Replace the presentation pacer. Tests swap in a no-op so trials run
    /// at full speed.
    pub fn set_pacer(&mut self, pacer: fn(Duration)) {
        self.pacer = pacer;
    }

    /// Run one trial: fixation until the spacebar, the timed stimulus
    /// presentation, the forced-choice response, then feedback. The
    /// presentation deadline is computed before the draw call so draw
    /// latency eats into the interval instead of extending it.
    pub fn run_trial(&mut self, ctx: &TrialContext) -> Result<TrialOutcome, TrialError> {
        self.frontend.show_fixation()?;
        if self.frontend.wait_key(&[Key::Confirm, Key::Quit])? == Key::Quit {
            return Ok(TrialOutcome::Quit);
        }

        let frame = ctx.pair.frame(
            ctx.disparity_arcmin / 60.0,
            f64::from(self.session.stim_spacing_deg),
        );
        let deadline = Instant::now() + Duration::from_secs_f64(ctx.duration_s);
        self.frontend.draw_stimuli(&frame)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        (self.pacer)(remaining);
        self.frontend.blank()?;

        self.frontend.show_text(reminder_text(self.session.stimulus))?;
        let response = self
            .frontend
            .wait_key(&[Key::ChoiceA, Key::ChoiceB, Key::Quit])?;
        if response == Key::Quit {
            return Ok(TrialOutcome::Quit);
        }

        let correct = u8::from(response == ctx.pair.correct_key);
        self.frontend
            .show_text(if correct == 1 { "Correct" } else { "Incorrect" })?;
        Ok(TrialOutcome::Completed(correct))
    }

    fn record_for(&self, ctx: &TrialContext, correct: u8) -> TrialRecord {
        TrialRecord {
            trial_num: ctx.trial_num,
            disparity_amplitude: ctx.disparity_arcmin,
            stimulus_duration: ctx.duration_s,
            item1: ctx.pair.slot1.display().to_string(),
            item2: ctx.pair.slot2.display().to_string(),
            pop_out_choice: ctx.pair.pop_out.label().to_string(),
            correct,
            background: self.background.clone(),
            time_stamp: TrialRecord::time_stamp_now(),
        }
    }

    fn draw_context(
        &mut self,
        trial_num: u32,
        duration_s: f64,
        disparity_arcmin: f64,
    ) -> Result<TrialContext, TrialError> {
        let pair = self
            .pools
            .draw_pair(&mut self.rng, self.session.h_disparity_arcmin)?;
        Ok(TrialContext {
            trial_num,
            duration_s,
            disparity_arcmin,
            pair,
        })
    }

    /// Show a pre-block prompt and wait for the spacebar. Returns false
    /// when the participant quits at the prompt.
    pub fn begin_gate(&mut self, text: &str) -> Result<bool, TrialError> {
        self.frontend.show_text(text)?;
        Ok(self.frontend.wait_key(&[Key::Confirm, Key::Quit])? == Key::Confirm)
    }

    /// Run the practice block with locally drawn parameters. Returns false
    /// if the participant quit partway through; completed trials are in
    /// the log either way.
    pub fn run_practice(&mut self, log: &mut TrialLog) -> Result<bool, TrialError> {
        self.frontend.show_text(PRACTICE_INSTRUCTIONS)?;
        // An example pair stays up behind the instructions.
        let example = self
            .pools
            .draw_pair(&mut self.rng, self.session.h_disparity_arcmin)?;
        self.frontend
            .draw_stimuli(&example.frame(0.0, f64::from(self.session.stim_spacing_deg)))?;
        if self.frontend.wait_key(&[Key::Confirm, Key::Quit])? == Key::Quit {
            return Ok(false);
        }

        let (dur_lo, dur_hi) = self.session.difficulty.duration_range();
        let (disp_lo, disp_hi) = self.session.difficulty.disparity_range();
        for trial_num in 1..=NUM_PRACTICE_TRIALS {
            let duration_s = self.rng.gen_range(dur_lo..=dur_hi);
            let disparity_arcmin = self.rng.gen_range(disp_lo..=disp_hi);
            let ctx = self.draw_context(trial_num, duration_s, disparity_arcmin)?;
            match self.run_trial(&ctx)? {
                TrialOutcome::Completed(correct) => {
                    log.append(&self.record_for(&ctx, correct))?;
                }
                TrialOutcome::Quit => {
                    info!("practice abandoned at trial {}", trial_num);
                    return Ok(false);
                }
            }
        }
        self.frontend.show_text("Practice over")?;
        Ok(true)
    }

    /// Run server-controlled trials until the staircase is finished or the
    /// participant quits. The exchange file is rewritten after every ask
    /// and every tell, so at no point is an answered ask only in memory.
    pub fn run_staircase(
        &mut self,
        client: &mut StaircaseClient,
        exchange_log: &ExchangeLog,
        log: &mut TrialLog,
    ) -> Result<(), TrialError> {
        let mut trial_num = 0;
        loop {
            let params = client.ask()?;
            exchange_log.write(client.exchanges())?;
            if params.is_finished {
                info!("staircase finished after {} trials", trial_num);
                return Ok(());
            }

            trial_num += 1;
            let ctx = self.draw_context(
                trial_num,
                params.config.duration_s(),
                params.config.disparity_arcmin(),
            )?;
            match self.run_trial(&ctx)? {
                TrialOutcome::Completed(correct) => {
                    client.tell(correct)?;
                    exchange_log.write(client.exchanges())?;
                    log.append(&self.record_for(&ctx, correct))?;
                }
                TrialOutcome::Quit => {
                    info!("run abandoned at trial {}", trial_num);
                    return Ok(());
                }
            }
        }
    }
}
