pub mod bluetooth;
pub mod idle;
pub mod logging;
