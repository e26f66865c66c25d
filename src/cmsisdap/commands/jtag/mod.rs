pub mod configure;
pub mod sequence;
