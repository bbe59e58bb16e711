pub mod process;

pub use process::{drain_and_exit, run_command_with_input};
