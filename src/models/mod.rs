pub mod appointment;
pub mod enums;
pub mod filters;
pub mod patient;
pub mod payment;
pub mod tooth_treatment;

pub use appointment::*;
pub use enums::*;
pub use filters::*;
pub use patient::*;
pub use payment::*;
pub use tooth_treatment::*;
