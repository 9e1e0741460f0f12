pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod signals;
pub mod stream;
pub mod util;
