mod install;
mod register;

pub use self::install::{install, InstallReport};
pub use self::register::{build_registration, submit_registration};
