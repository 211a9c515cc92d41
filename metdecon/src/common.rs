#![allow(dead_code)]

pub use log::{info, warn};

pub use decon_core::common::{DVec, Mat};
