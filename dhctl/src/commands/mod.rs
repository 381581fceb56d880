pub mod check_version;
pub mod converge;
pub mod lock_release;
