pub mod v1;
pub mod v1alpha1;

pub use v1::nodeuser::{NodeUser, NodeUserSpec};
pub use v1alpha1::deckhouserelease::{DeckhouseRelease, DeckhouseReleaseSpec, DeckhouseReleaseStatus};
