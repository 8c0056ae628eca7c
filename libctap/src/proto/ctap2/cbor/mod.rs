mod request;
mod response;
mod value;

pub use request::CborRequest;
pub use response::CborResponse;
pub use value::{
    as_array, as_bool, as_bytes, as_int, as_map, as_text, as_text_array, as_uint, as_uint_array,
    as_value, deserialize, serialize, CborMap, CborResponseModel,
};
