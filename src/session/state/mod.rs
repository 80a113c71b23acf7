mod state_drain;
mod state_settings;

pub use state_drain::{DrainState, StateDrain};
pub use state_settings::StateSettings;
