//! Multi-object tracking: Kalman prediction, global association and track lifecycle.

mod detection;
mod kalman_filter;
mod matching;
mod multi_tracker;
mod rect;
mod track;
mod track_state;

pub use detection::Detection;
pub use kalman_filter::{KalmanConfig, KalmanFilter, KalmanState};
pub use matching::{AssignmentResult, AssociationConfig, Candidate, cost_matrix, linear_assignment};
pub use multi_tracker::{Tracker, TrackerConfig, TrackerStats, UpdateSummary};
pub use rect::{Rect, iou_batch};
pub use track::{Prediction, Track, TrajectoryPoint, Velocity};
pub use track_state::TrackState;
