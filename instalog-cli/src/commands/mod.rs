//! Command handlers -- one module per subcommand

pub mod flush;
pub mod inspect;
pub mod pause;
pub mod restart;
pub mod start;
pub mod status;
pub mod stop;
