pub mod debounce;
pub mod keymap;
pub mod reader;
pub mod supervisor;

pub use keymap::KeyMap;
pub use supervisor::{DeviceSupervisor, SupervisorCommand, SupervisorConfig};
