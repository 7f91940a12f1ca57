//! # tb-link
//!
//! Plant-facing communication layer for TiltBench. Defines the narrow
//! [`RobotLink`] interface the tuner drives the robot through, and a
//! simulated robot ([`SimRobot`]) implementing the same interface for
//! development and tests without hardware.

pub mod link;
pub mod sim;

pub use link::{ConnectionStatus, LinkError, LinkResult, RobotLink, CMD_RELAY, CMD_SET_PARAM};
pub use sim::{SimRobot, SimRobotConfig};
