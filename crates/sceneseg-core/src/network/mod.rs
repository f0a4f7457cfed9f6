pub mod init;
pub mod model;
pub mod topology;

pub use init::TruncatedNormal;
pub use model::{SegNet, SegOutput, argmax_channels};
pub use topology::{ConvSpec, DecoderSpec, EncoderStage, ParamSpec, Topology};
