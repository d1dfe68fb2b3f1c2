pub mod socket;
pub mod system;
