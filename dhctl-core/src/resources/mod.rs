use std::borrow::Cow;

use thiserror::Error;

pub mod annotations;
pub mod crd;
pub mod labels;
pub mod nodegroup;
pub mod secret;

#[derive(Debug, Error)]
pub enum ResourceGenerationError {
    #[error("Resource contains invalid data ({})!", .0)]
    InvalidData(Cow<'static, str>),
    #[error("Resource is missing required data ({})!", .0)]
    MissingData(Cow<'static, str>),
    #[error("Provided resource is missing a name!")]
    MissingMetadataName,
}
