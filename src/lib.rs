pub mod bolt;
pub mod cfg;
pub mod client;
pub mod cmd;
pub mod engine;
pub mod logging;
pub mod pacing;
pub mod report;
pub mod session;
pub mod stat;
pub mod tls;
pub mod worker;
