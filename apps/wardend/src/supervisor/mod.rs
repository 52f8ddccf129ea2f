mod logs;
mod monitor;
mod players;
mod port;
mod process;
mod state;

pub use logs::LogStore;
pub use players::PlayerTracker;
pub use process::{LaunchSpec, ProcessSupervisor};
