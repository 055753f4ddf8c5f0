pub mod notify;
pub mod sequencer;
