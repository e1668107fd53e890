pub mod svi_calibrator;
pub mod svi_model;
