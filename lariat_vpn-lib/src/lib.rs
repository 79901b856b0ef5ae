pub mod config;
pub mod logging;
pub mod shell_command_ext;
