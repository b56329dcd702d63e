pub mod capture;
pub mod compare;
pub mod exec;
pub mod report;
pub mod setup_diff;
pub mod status;
