pub mod bridge;
pub mod channel;
pub mod compile;
pub mod epoch;
pub mod logging;
