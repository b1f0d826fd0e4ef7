pub mod background_model;
pub mod defect_stage;
pub mod event_bus;
pub mod features;
pub mod frame;
pub mod morphology;
pub mod motion_detector;
pub mod motion_timer;
pub mod quality_scorer;
pub mod stage;

#[cfg(test)]
pub(crate) mod test_support;
