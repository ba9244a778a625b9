//! Time To Fuse is a binocular-disparity psychophysics task: on every trial
//! a pair of stimuli (a real and a nonsense word, or a flower and a bird) is
//! presented, one of the two carries a small horizontal disparity offset that
//! makes it "pop out" in depth, and the participant makes a forced choice
//! about which class popped out. Trial parameters (stimulus duration and
//! disparity amplitude) are either drawn locally during practice or supplied
//! by an external adaptive-staircase server over a socket protocol.
//!
//! This crate is the control-loop side of the apparatus: session setup,
//! stimulus selection and counterbalancing, the staircase-server protocol
//! client, durable trial and parameter-exchange logging, and the per-subject
//! binocular centering offset. Actual rendering sits behind the
//! [`frontend::Frontend`] trait and is deliberately thin; the haploscope
//! geometry itself lives with the display hardware, not here.

#![warn(missing_docs)]
pub mod args;
pub mod calibration;
pub mod frontend;
pub mod persistence;
pub mod session;
pub mod staircase;
pub mod stimulus;
pub mod trial;
