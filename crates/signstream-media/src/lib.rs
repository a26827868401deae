//! Signstream Media - frame codec and the landmark-extraction operator

pub mod codec;
pub mod extract;

pub use codec::{decode_base64_frame, encode_frame_to_base64, scale_frame, CodecError};
pub use extract::{CentroidExtractor, Extraction, LandmarkExtractor};
