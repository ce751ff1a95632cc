//! Control-loop logic with no I/O: RTT statistics and the adaptive bitrate
//! controller.

pub mod bitrate;
pub mod rtt;

pub use bitrate::{
    BitrateConfig, BitrateConfigError, BitrateController, BitrateDecision, BitrateFeedback,
    BitrateState,
};
pub use rtt::RttEstimator;
