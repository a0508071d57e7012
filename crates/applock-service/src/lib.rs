pub mod elevation;
pub mod instance;
pub mod monitor;
pub mod protection;
pub mod session;
