pub mod common;
pub mod initializer;
pub mod model;
pub mod nnls;
pub mod objective;
pub mod optimizer;
pub mod pseudo_counts;
pub mod tensor_convert;

pub use candle_core;
pub use candle_nn;
