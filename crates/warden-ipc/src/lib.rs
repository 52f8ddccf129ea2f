pub mod framing;
pub mod paths;
pub mod socket;
