//! The display and input boundary. Everything the trial loop needs from the
//! apparatus is behind the [`Frontend`] trait: draw a stimulus pair, show a
//! line of text, and block on a restricted key set. The real haploscope
//! rendering (windows, anaglyph colors, monitor geometry) is a separate
//! concern that plugs in here; this crate ships a thin terminal
//! implementation for development and a scripted one for tests.

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal,
};
use std::{borrow::Cow, collections::VecDeque, fmt, path::PathBuf};

/// The restricted key vocabulary of the task. Physical bindings: space is
/// confirm, `q` is quit, `1` (left) chooses the target class, `3` (right)
/// chooses the foil class, arrows adjust the manual alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Space: start a trial, confirm an adjustment.
    Confirm,
    /// `q`: leave the run, with full cleanup.
    Quit,
    /// `1`: "the real word / flower popped out".
    ChoiceA,
    /// `3`: "the nonsense word / bird popped out".
    ChoiceB,
    /// Arrow up.
    Up,
    /// Arrow down.
    Down,
    /// Arrow left.
    Left,
    /// Arrow right.
    Right,
}

/// One stimulus presentation: the two items by slot, the per-item
/// horizontal micro-offsets, and the vertical disparity. Positions are in
/// degrees; the frontend owns turning them into pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusFrame {
    /// Item in the right slot (at +spacing/2).
    pub slot1: PathBuf,
    /// Item in the left slot (at -spacing/2).
    pub slot2: PathBuf,
    /// Horizontal micro-offset on the right-slot item, degrees.
    pub slot1_offset_deg: f64,
    /// Horizontal micro-offset on the left-slot item, degrees.
    pub slot2_offset_deg: f64,
    /// Vertical disparity applied between the eyes, degrees.
    pub disparity_deg: f64,
    /// Gap between the two slots, degrees.
    pub spacing_deg: f64,
}

/// Errors at the display/input boundary.
#[derive(Debug)]
pub enum FrontendError {
    /// Io from the terminal or the windowing layer.
    IoError(std::io::Error),
    /// A scripted frontend ran out of scripted keys.
    ScriptExhausted,
}

impl fmt::Display for FrontendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            FrontendError::IoError(e) => Cow::from(format!("io error: {}", e)),
            FrontendError::ScriptExhausted => Cow::from("scripted key queue is empty"),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for FrontendError {}

impl From<std::io::Error> for FrontendError {
    fn from(value: std::io::Error) -> Self {
        FrontendError::IoError(value)
    }
}

/// What the trial loop needs from the apparatus.
pub trait Frontend {
    /// Show a line of instruction or feedback text on all active screens.
    fn show_text(&mut self, text: &str) -> Result<(), FrontendError>;

    /// Show the fixation marker that prompts the participant to start a
    /// trial.
    fn show_fixation(&mut self) -> Result<(), FrontendError>;

    /// Show the alignment target (circle and plus) at the given offset for
    /// the manual calibration fallback.
    fn show_alignment(&mut self, h_deg: f64, v_deg: f64) -> Result<(), FrontendError>;

    /// Present a stimulus pair. The caller owns the presentation clock;
    /// this draws once and returns.
    fn draw_stimuli(&mut self, frame: &StimulusFrame) -> Result<(), FrontendError>;

    /// Clear the stimulus screens.
    fn blank(&mut self) -> Result<(), FrontendError>;

    /// Block until the participant presses one of `allowed`; all other
    /// keys are ignored.
    fn wait_key(&mut self, allowed: &[Key]) -> Result<Key, FrontendError>;
}

/// Development frontend that narrates the run on the terminal and reads
/// keys in raw mode. Stands in for the haploscope windows when working on
/// the control loop away from the rig.
#[derive(Debug, Default)]
pub struct TerminalFrontend {}

impl TerminalFrontend {
    /// A new terminal frontend.
    pub fn new() -> Self {
        TerminalFrontend {}
    }

    fn map_key(code: KeyCode) -> Option<Key> {
        match code {
            KeyCode::Char(' ') => Some(Key::Confirm),
            KeyCode::Char('q') => Some(Key::Quit),
            KeyCode::Char('1') => Some(Key::ChoiceA),
            KeyCode::Char('3') => Some(Key::ChoiceB),
            KeyCode::Up => Some(Key::Up),
            KeyCode::Down => Some(Key::Down),
            KeyCode::Left => Some(Key::Left),
            KeyCode::Right => Some(Key::Right),
            _ => None,
        }
    }
}

impl Frontend for TerminalFrontend {
    fn show_text(&mut self, text: &str) -> Result<(), FrontendError> {
        println!("{}", text);
        Ok(())
    }

    fn show_fixation(&mut self) -> Result<(), FrontendError> {
        println!("+");
        Ok(())
    }

    fn show_alignment(&mut self, h_deg: f64, v_deg: f64) -> Result<(), FrontendError> {
        println!("align: plus at ({:+.1}, {:+.1}) deg", h_deg, v_deg);
        Ok(())
    }

    fn draw_stimuli(&mut self, frame: &StimulusFrame) -> Result<(), FrontendError> {
        println!(
            "stimuli: [{}] ({:+.3} deg)  [{}] ({:+.3} deg), disparity {:.3} deg",
            frame.slot2.display(),
            frame.slot2_offset_deg,
            frame.slot1.display(),
            frame.slot1_offset_deg,
            frame.disparity_deg,
        );
        Ok(())
    }

    fn blank(&mut self) -> Result<(), FrontendError> {
        Ok(())
    }

    fn wait_key(&mut self, allowed: &[Key]) -> Result<Key, FrontendError> {
        terminal::enable_raw_mode()?;
        let key = loop {
            if let Event::Key(ev) = event::read()? {
                if ev.kind != KeyEventKind::Press {
                    continue;
                }
                if let Some(key) = Self::map_key(ev.code) {
                    if allowed.contains(&key) {
                        break key;
                    }
                }
            }
        };
        terminal::disable_raw_mode()?;
        Ok(key)
    }
}

/// A frontend that replays a fixed key script and records what was shown.
/// The test double for the whole display layer.
#[derive(Debug, Default)]
pub struct ScriptedFrontend {
    keys: VecDeque<Key>,
    /// Every text line shown, in order.
    pub texts: Vec<String>,
    /// Every stimulus frame drawn, in order.
    pub frames: Vec<StimulusFrame>,
    /// Number of fixation markers shown.
    pub fixations: usize,
}

impl ScriptedFrontend {
    /// A scripted frontend that will produce `keys` in order.
    pub fn new(keys: Vec<Key>) -> Self {
        ScriptedFrontend {
            keys: VecDeque::from(keys),
            texts: Vec::new(),
            frames: Vec::new(),
            fixations: 0,
        }
    }
}

impl Frontend for ScriptedFrontend {
    fn show_text(&mut self, text: &str) -> Result<(), FrontendError> {
        self.texts.push(text.to_owned());
        Ok(())
    }

    fn show_fixation(&mut self) -> Result<(), FrontendError> {
        self.fixations += 1;
        Ok(())
    }

    fn show_alignment(&mut self, _h_deg: f64, _v_deg: f64) -> Result<(), FrontendError> {
        Ok(())
    }

    fn draw_stimuli(&mut self, frame: &StimulusFrame) -> Result<(), FrontendError> {
        self.frames.push(frame.clone());
        Ok(())
    }

    fn blank(&mut self) -> Result<(), FrontendError> {
        Ok(())
    }

    fn wait_key(&mut self, allowed: &[Key]) -> Result<Key, FrontendError> {
        // Drop scripted keys outside the allowed set, like a participant
        // pressing a key nobody is listening for.
        while let Some(key) = self.keys.pop_front() {
            if allowed.contains(&key) {
                return Ok(key);
            }
        }
        Err(FrontendError::ScriptExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_frontend_filters_disallowed_keys() {
        let mut f = ScriptedFrontend::new(vec![Key::Up, Key::ChoiceA, Key::Confirm]);
        // Up and ChoiceA are not in the allowed set here.
        assert_eq!(f.wait_key(&[Key::Confirm, Key::Quit]).unwrap(), Key::Confirm);
    }

    #[test]
    fn scripted_frontend_errors_when_exhausted() {
        let mut f = ScriptedFrontend::new(vec![]);
        assert!(matches!(
            f.wait_key(&[Key::Confirm]),
            Err(FrontendError::ScriptExhausted)
        ));
    }

    #[test]
    fn terminal_key_mapping_covers_the_task_vocabulary() {
        assert_eq!(TerminalFrontend::map_key(KeyCode::Char(' ')), Some(Key::Confirm));
        assert_eq!(TerminalFrontend::map_key(KeyCode::Char('q')), Some(Key::Quit));
        assert_eq!(TerminalFrontend::map_key(KeyCode::Char('1')), Some(Key::ChoiceA));
        assert_eq!(TerminalFrontend::map_key(KeyCode::Char('3')), Some(Key::ChoiceB));
        assert_eq!(TerminalFrontend::map_key(KeyCode::Char('x')), None);
    }
}
