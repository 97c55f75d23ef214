pub mod properties;
pub mod reason_codes;

pub use properties::{Properties, PropertyId, PropertyValue, PropertyValueType};
pub use reason_codes::ReasonCode;
