mod deadline;
mod shutdown_signal;
mod single_flight;
mod wrapper;

pub use deadline::{await_receipt, with_timeout};
pub use shutdown_signal::shutdown_signal;
pub use single_flight::FlightGuard;
pub use wrapper::Wrapper;
