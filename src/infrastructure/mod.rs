pub mod bluetooth;
pub mod logging;
pub mod oscquery;
pub mod shutdown;
